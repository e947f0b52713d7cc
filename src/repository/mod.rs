//! The repository facade: open/create against a backend, state rebuild
//! and merge, the blob read path with its length-hiding range requests,
//! snapshot deletion and the advisory lock surface. Writes go through
//! [`Transaction`] sessions.

pub mod transaction;

pub use transaction::Transaction;

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::backend::Backend;
use crate::chunker::Chunker;
use crate::codec::{envelope, Pipeline};
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::hashing::Keys;
use crate::packfile::PackReader;
use crate::resource::{Mac, ResourceType};
use crate::state::{CacheProvider, LocalState, STATE_VERSION};

pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepositoryConfig,
    keys: Keys,
    pipeline: Arc<Pipeline>,
    chunker: Chunker,
    state: LocalState,
    caches: CacheProvider,
}

impl Repository {
    /// Initialize an empty repository on the backend. For encrypted
    /// configurations the key set is derived from `secret` and a canary
    /// is sealed into the configuration so a wrong secret is caught at
    /// open.
    pub async fn create(
        backend: Arc<dyn Backend>,
        mut config: RepositoryConfig,
        secret: Option<&[u8]>,
    ) -> Result<()> {
        config.validate()?;
        if config.encryption.is_none() && secret.is_some() {
            return Err(Error::ConfigInvalid(
                "secret provided for an unencrypted repository".into(),
            ));
        }

        let keys = Keys::derive(&config, secret)?;
        config.set_canary(keys.canary());

        let serialized = config.serialize()?;
        let wrapped = envelope::wrap(
            &keys,
            ResourceType::Config,
            ResourceType::Config.version(),
            &serialized,
        );
        backend.create(&wrapped).await?;

        tracing::info!(repository = %config.repository_id, "created repository");
        Ok(())
    }

    /// Open the repository and rebuild the aggregated state from every
    /// published state object.
    pub async fn open(
        backend: Arc<dyn Backend>,
        caches: CacheProvider,
        secret: Option<&[u8]>,
    ) -> Result<Self> {
        let repository = Self::open_no_rebuild(backend, caches, secret).await?;
        repository.rebuild_state().await?;
        Ok(repository)
    }

    /// Open without rebuilding; for read-only clients that tolerate a
    /// stale local index.
    pub async fn open_no_rebuild(
        backend: Arc<dyn Backend>,
        caches: CacheProvider,
        secret: Option<&[u8]>,
    ) -> Result<Self> {
        let raw = backend.open().await?;

        // the configuration must be parsed before the keys verifying its
        // envelope can exist
        let parsed = envelope::Envelope::parse(ResourceType::Config, &raw)?;
        let config = RepositoryConfig::deserialize(parsed.inner)?;
        let keys = Keys::derive(&config, secret)?;

        if let Some(enc) = &config.encryption {
            let canary = Mac::from_slice(&enc.canary).map_err(|_| Error::IntegrityFailure)?;
            if canary != keys.canary() {
                return Err(Error::IntegrityFailure);
            }
        }
        parsed.verify(&keys)?;

        let pipeline = Arc::new(Pipeline::from_config(&config, &keys)?);
        let chunker = Chunker::new(&config.chunking);
        let state = LocalState::new_aggregate(caches.open_aggregate().await?);
        state.update_serial_or(config.repository_id).await?;

        Ok(Self {
            backend,
            config,
            keys,
            pipeline,
            chunker,
            state,
            caches,
        })
    }

    /// Fold every state object we have not yet merged into the local
    /// aggregated state, and drop local state ids the backend no longer
    /// has.
    pub async fn rebuild_state(&self) -> Result<()> {
        let remote: HashSet<Mac> = self.backend.get_states().await?.into_iter().collect();
        let local: HashSet<Mac> = self.state.list_states().await?.into_iter().collect();

        let mut merged = 0usize;
        for &id in remote.difference(&local) {
            let raw = self.backend.get_state(id).await?;
            let (version, inner) = envelope::unwrap(&self.keys, ResourceType::State, &raw)?;
            let decoded = self.pipeline.decode(inner)?;
            self.state.merge_state(version, id, &decoded).await?;
            merged += 1;
        }

        let mut dropped = 0usize;
        for &id in local.difference(&remote) {
            self.state.del_state(id).await?;
            dropped += 1;
        }

        self.state.update_serial_or(self.config.repository_id).await?;

        if merged > 0 || dropped > 0 {
            tracing::info!(merged, dropped, "rebuilt state");
        }
        Ok(())
    }

    pub fn configuration(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub(crate) fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub(crate) fn keys(&self) -> &Keys {
        &self.keys
    }

    pub(crate) fn caches(&self) -> &CacheProvider {
        &self.caches
    }

    /// Content address of a plaintext under this repository's MAC key.
    pub fn compute_mac(&self, data: &[u8]) -> Mac {
        self.keys.compute_mac(data)
    }

    /// Begin a write session. All mutations happen through the returned
    /// transaction; there is no way to put a blob outside one.
    pub async fn start_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self).await
    }

    pub async fn blob_exists(&self, resource: ResourceType, mac: Mac) -> Result<bool> {
        self.state.blob_exists(resource, mac).await
    }

    /// Resolve and read one blob. The backend range request is jittered
    /// so observed `(offset, length)` pairs do not reveal exact blob
    /// sizes: a draw uniform in `[0, 2^(log2(len)/2))` is split into
    /// bytes requested before and after the blob, discarded after the
    /// read.
    pub async fn get_blob(&self, resource: ResourceType, mac: Mac) -> Result<Vec<u8>> {
        let location = self
            .state
            .get_subpart_for_blob(resource, mac)
            .await?
            .ok_or(Error::BlobNotFound { resource, mac })?;

        let (front, back) = padded_range(location.offset, location.length);
        let request_offset = envelope::HEADER_SIZE as u64 + location.offset - front;
        let request_length = (u64::from(location.length) + front + back) as u32;

        let data = self
            .backend
            .get_packfile_blob(location.packfile, request_offset, request_length)
            .await?;

        let start = front as usize;
        let end = start + location.length as usize;
        if data.len() < end {
            return Err(Error::IntegrityFailure);
        }

        let plain = self.pipeline.decode(&data[start..end])?;
        if self.keys.compute_mac(&plain) != mac {
            return Err(Error::IntegrityFailure);
        }
        Ok(plain)
    }

    /// Fetch and verify a whole packfile: backend key against content
    /// MAC, envelope seal, then index against footer.
    pub async fn get_packfile(&self, mac: Mac) -> Result<PackReader> {
        let raw = self.backend.get_packfile(mac).await?;
        if self.keys.compute_mac(&raw) != mac {
            return Err(Error::IntegrityFailure);
        }
        let (_, inner) = envelope::unwrap(&self.keys, ResourceType::Packfile, &raw)?;
        PackReader::parse(inner.to_vec(), &self.pipeline)
    }

    /// Read one blob by scanning a packfile's own index instead of the
    /// state; the slow path used when checking a packfile end to end.
    pub async fn get_blob_from_packfile(
        &self,
        packfile: Mac,
        resource: ResourceType,
        mac: Mac,
    ) -> Result<Vec<u8>> {
        let reader = self.get_packfile(packfile).await?;
        let entry = *reader
            .find(resource, mac)
            .ok_or(Error::BlobNotFound { resource, mac })?;
        let plain = reader.blob(&entry, &self.pipeline)?;
        if self.keys.compute_mac(&plain) != mac {
            return Err(Error::IntegrityFailure);
        }
        Ok(plain)
    }

    /// Record a deletion tombstone for a snapshot and publish it as a
    /// state of its own, named by the MAC of its serialized bytes.
    /// Physical reclamation is left to an external collector.
    pub async fn delete_snapshot(&self, snapshot: Mac) -> Result<Mac> {
        let scratch = self.state.derive(self.caches.open_scratch().await?);
        let deleted_at = scratch.delete_resource(ResourceType::Snapshot, snapshot).await?;

        let bytes = scratch.serialize().await?;
        let encoded = self.pipeline.encode(&bytes)?;
        let wrapped = envelope::wrap(&self.keys, ResourceType::State, STATE_VERSION, &encoded);
        let id = self.keys.compute_mac(&wrapped);

        self.backend.put_state(id, &wrapped).await?;
        self.state
            .delete_resource_at(ResourceType::Snapshot, snapshot, deleted_at)
            .await?;
        self.state.put_state(id).await?;

        tracing::info!(snapshot = %snapshot, state = %id, "deleted snapshot");
        Ok(id)
    }

    /// Drop a packfile from the backend and from every per-state set; the
    /// primitive an external garbage collector builds on.
    pub async fn remove_packfile(&self, mac: Mac) -> Result<()> {
        self.backend.delete_packfile(mac).await?;
        self.state.del_packfile(mac).await
    }

    // -- advisory locks; payloads are wrapped but never interpreted ----

    pub async fn get_locks(&self) -> Result<Vec<Mac>> {
        Ok(self.backend.get_locks().await?)
    }

    pub async fn put_lock(&self, lock: Mac, payload: &[u8]) -> Result<u64> {
        let encoded = self.pipeline.encode(payload)?;
        let wrapped = envelope::wrap(
            &self.keys,
            ResourceType::Lock,
            ResourceType::Lock.version(),
            &encoded,
        );
        Ok(self.backend.put_lock(lock, &wrapped).await?)
    }

    pub async fn get_lock(&self, lock: Mac) -> Result<Vec<u8>> {
        let raw = self.backend.get_lock(lock).await?;
        let (_, inner) = envelope::unwrap(&self.keys, ResourceType::Lock, &raw)?;
        self.pipeline.decode(inner)
    }

    pub async fn delete_lock(&self, lock: Mac) -> Result<()> {
        Ok(self.backend.delete_lock(lock).await?)
    }

    /// Best-effort total byte count of the backend.
    pub async fn size(&self) -> Result<i64> {
        Ok(self.backend.size().await?)
    }
}

/// Split a fresh jitter draw into bytes to over-read before and after a
/// blob of `length` bytes at `offset`. The total overhead is uniform in
/// `[0, 2^(log2(length)/2))`; the front share never reaches before the
/// start of the packfile's data region.
pub(crate) fn padded_range(offset: u64, length: u32) -> (u64, u64) {
    if length == 0 {
        return (0, 0);
    }
    let overhead = 1u64 << (u64::from(length).ilog2() / 2);
    let delta = rand::thread_rng().gen_range(0..overhead);
    let front = delta.min(offset);
    (front, delta - front)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_range_bounds() {
        // L = 186: overhead = 2^(ilog2(186)/2) = 2^3 = 8
        for _ in 0..1000 {
            let (front, back) = padded_range(1000, 186);
            assert!(front + back < 8);
        }

        // front never reaches before the data region
        for _ in 0..1000 {
            let (front, _) = padded_range(3, 186);
            assert!(front <= 3);
        }

        assert_eq!(padded_range(50, 0), (0, 0));

        // L = 1: overhead = 1, draw is always 0
        assert_eq!(padded_range(50, 1), (0, 0));
    }

    #[test]
    fn padded_range_distribution() {
        // 10_000 draws for L = 186: requested lengths lie in
        // [186, 186 + 8) and average about 186 + 3.5
        let samples = 10_000;
        let mut total = 0u64;
        for _ in 0..samples {
            let (front, back) = padded_range(1 << 20, 186);
            let requested = 186 + front + back;
            assert!((186..194).contains(&requested));
            total += requested;
        }
        let mean = total as f64 / samples as f64;
        assert!(
            (mean - 189.5).abs() < 0.5,
            "mean requested length {mean} strayed from 189.5"
        );
    }
}

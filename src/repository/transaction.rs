//! Write sessions. A transaction owns a derived delta state and a running
//! packer pipeline; committing drains the pipeline, seals the delta state
//! and publishes it. Dropping a transaction without committing discards
//! its unpublished work.

use std::io::Read;
use std::sync::Arc;

use crate::codec::envelope;
use crate::error::{Error, Result};
use crate::hashing;
use crate::packer::{InflightIndex, PackerCtx, PackerManager, PackerMsg};
use crate::repository::Repository;
use crate::resource::{now_unix, Mac, ResourceType};
use crate::state::{LocalState, STATE_VERSION};

pub struct Transaction<'r> {
    repo: &'r Repository,
    delta: LocalState,
    inflight: Arc<InflightIndex>,
    packer: Option<PackerManager>,
}

impl<'r> Transaction<'r> {
    pub(crate) async fn begin(repo: &'r Repository) -> Result<Self> {
        let delta = repo.state().derive(repo.caches().open_scratch().await?);
        let inflight = Arc::new(InflightIndex::new());
        let packer = Self::spawn_packer(repo, &delta, &inflight);
        Ok(Self {
            repo,
            delta,
            inflight,
            packer: Some(packer),
        })
    }

    fn spawn_packer(
        repo: &Repository,
        delta: &LocalState,
        inflight: &Arc<InflightIndex>,
    ) -> PackerManager {
        let ctx = PackerCtx {
            backend: repo.backend().clone(),
            pipeline: repo.pipeline().clone(),
            keys: repo.keys().clone(),
            inflight: inflight.clone(),
            delta: delta.clone(),
            aggregated: repo.state().clone(),
            session: hashing::hash(delta.serial().as_bytes()),
            max_size: repo.configuration().packfile.max_size,
            pad_max: repo.configuration().chunking.min_size,
        };
        PackerManager::spawn(Arc::new(ctx), num_cpus::get())
    }

    fn packer(&self) -> Result<&PackerManager> {
        self.packer.as_ref().ok_or(Error::TransactionClosed)
    }

    /// Queue one blob for packing. Returns once the blob is deduplicated
    /// or enqueued; durability comes with the enclosing packfile flush,
    /// visibility with commit.
    pub async fn put_blob(
        &self,
        resource: ResourceType,
        mac: Mac,
        data: &[u8],
    ) -> Result<()> {
        if self.repo.blob_exists(resource, mac).await? {
            return Ok(());
        }
        if self.inflight.insert_if_not_present(resource, mac) {
            // a prior caller owns this blob; duplicate data is dropped
            return Ok(());
        }

        let result = async {
            let encoded = self.repo.pipeline().encode(data)?;
            self.packer()?
                .send(PackerMsg {
                    resource,
                    version: resource.version(),
                    timestamp: now_unix(),
                    mac,
                    data: encoded,
                    flags: 0,
                })
                .await
        }
        .await;

        if result.is_err() {
            // not enqueued; the caller may retry with a fresh put
            self.inflight.remove(resource, mac);
        }
        result
    }

    pub async fn put_blob_if_not_exists(
        &self,
        resource: ResourceType,
        mac: Mac,
        data: &[u8],
    ) -> Result<()> {
        if self.repo.blob_exists(resource, mac).await? {
            return Ok(());
        }
        self.put_blob(resource, mac, data).await
    }

    /// Run the content-defined chunker over a byte stream and store every
    /// chunk as a `Chunk` blob. Returns the chunk addresses and sizes in
    /// stream order; an empty source yields an empty list.
    pub async fn put_chunked<R: Read>(&self, source: R) -> Result<Vec<(Mac, u64)>> {
        let mut written = Vec::new();
        for chunk in self.repo.chunker().chunks(source) {
            let chunk = chunk?;
            let mac = self.repo.compute_mac(&chunk.data);
            self.put_blob(ResourceType::Chunk, mac, &chunk.data).await?;
            written.push((mac, chunk.data.len() as u64));
        }
        Ok(written)
    }

    /// Tombstone `(resource, mac)` in this session and in the aggregated
    /// state.
    pub async fn delete_resource(&self, resource: ResourceType, mac: Mac) -> Result<()> {
        let deleted_at = self.delta.delete_resource(resource, mac).await?;
        self.repo
            .state()
            .delete_resource_at(resource, mac, deleted_at)
            .await
    }

    /// Checkpoint a long session: drain the packer, publish the delta
    /// state under `id`, then continue with a fresh delta state and
    /// packer.
    pub async fn flush(&mut self, id: Mac) -> Result<()> {
        let packer = self.packer.take().ok_or(Error::TransactionClosed)?;
        packer.wait().await?;
        self.seal(id).await?;

        self.delta = self
            .repo
            .state()
            .derive(self.repo.caches().open_scratch().await?);
        self.inflight = Arc::new(InflightIndex::new());
        self.packer = Some(Self::spawn_packer(self.repo, &self.delta, &self.inflight));
        Ok(())
    }

    /// Drain the packer and publish the delta state under `id`, ending
    /// the session.
    pub async fn commit(mut self, id: Mac) -> Result<()> {
        let packer = self.packer.take().ok_or(Error::TransactionClosed)?;
        packer.wait().await?;
        self.seal(id).await
    }

    /// Cancel the session: the pipeline unwinds, partial packfiles are
    /// never uploaded, and nothing is published.
    pub async fn abort(mut self) {
        if let Some(packer) = self.packer.take() {
            packer.abort().await;
        }
    }

    async fn seal(&self, id: Mac) -> Result<()> {
        let bytes = self.delta.serialize().await?;
        let encoded = self.repo.pipeline().encode(&bytes)?;
        let wrapped = envelope::wrap(
            self.repo.keys(),
            ResourceType::State,
            STATE_VERSION,
            &encoded,
        );
        self.repo.backend().put_state(id, &wrapped).await?;
        self.repo.state().put_state(id).await?;

        tracing::info!(state = %id, "published state");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(packer) = self.packer.take() {
            tracing::warn!("transaction dropped without commit or abort");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(packer.abort());
            }
        }
    }
}

//! The local state: a durable map from `(resource, mac)` to the packfile
//! location of each blob, deletion tombstones, and the set of packfiles
//! each state produced. A repository aggregates every published state into
//! one union; writers build fresh delta states and publish them at commit.

pub mod cache;
pub mod serial;

pub use cache::{CacheProvider, StateCache};
pub use serial::STATE_VERSION;

use std::io::Write;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::Result;
use crate::resource::{now_unix, Location, Mac, ResourceType};
use serial::{Record, RecordParser};

/// A single `(resource, mac) → location` binding inside a state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeltaEntry {
    pub resource: ResourceType,
    pub version: u32,
    pub mac: Mac,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub version: u32,
    pub timestamp: i64,
    pub serial: Uuid,
    pub aggregate: bool,
    pub extends: Vec<Mac>,
}

#[derive(Clone)]
pub struct LocalState {
    cache: StateCache,
    metadata: Arc<RwLock<Metadata>>,
}

impl LocalState {
    /// An empty state over the given cache, with fresh metadata and a
    /// random serial.
    pub fn new(cache: StateCache) -> Self {
        Self {
            cache,
            metadata: Arc::new(RwLock::new(Metadata {
                version: STATE_VERSION,
                timestamp: now_unix(),
                serial: Uuid::new_v4(),
                aggregate: false,
                extends: Vec::new(),
            })),
        }
    }

    /// An aggregate state: the in-memory union a repository maintains
    /// over every published state.
    pub fn new_aggregate(cache: StateCache) -> Self {
        let state = Self::new(cache);
        state.metadata.write().expect("metadata lock").aggregate = true;
        state
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.read().expect("metadata lock").clone()
    }

    pub fn serial(&self) -> Uuid {
        self.metadata.read().expect("metadata lock").serial
    }

    /// Pin the serial to `default` unless a committed state has already
    /// been observed; the first writer's serial is the repository UUID.
    pub async fn update_serial_or(&self, default: Uuid) -> Result<()> {
        if self.cache.list_states().await?.is_empty() {
            self.metadata.write().expect("metadata lock").serial = default;
        }
        Ok(())
    }

    /// A scratch delta state over a fresh cache, used by write sessions.
    pub fn derive(&self, cache: StateCache) -> LocalState {
        LocalState::new(cache)
    }

    // -- state set -----------------------------------------------------

    pub async fn has_state(&self, id: Mac) -> Result<bool> {
        self.cache.has_state(id).await
    }

    pub async fn put_state(&self, id: Mac) -> Result<()> {
        self.cache.put_state(id).await
    }

    pub async fn del_state(&self, id: Mac) -> Result<()> {
        self.cache.del_state(id).await
    }

    pub async fn list_states(&self) -> Result<Vec<Mac>> {
        self.cache.list_states().await
    }

    // -- deltas and tombstones ----------------------------------------

    pub async fn put_delta(&self, entry: &DeltaEntry) -> Result<()> {
        self.cache.put_delta(entry).await
    }

    /// Location lookup. Tombstones shadow deltas: a deleted resource
    /// reads as absent.
    pub async fn get_subpart_for_blob(
        &self,
        resource: ResourceType,
        mac: Mac,
    ) -> Result<Option<Location>> {
        if self.cache.get_tombstone(resource, mac).await?.is_some() {
            return Ok(None);
        }
        Ok(self.cache.get_delta(resource, mac).await?.map(|e| e.location))
    }

    pub async fn blob_exists(&self, resource: ResourceType, mac: Mac) -> Result<bool> {
        Ok(self.get_subpart_for_blob(resource, mac).await?.is_some())
    }

    /// Mark `(resource, mac)` deleted as of now.
    pub async fn delete_resource(&self, resource: ResourceType, mac: Mac) -> Result<i64> {
        let deleted_at = now_unix();
        self.cache.put_tombstone(resource, mac, deleted_at).await?;
        Ok(deleted_at)
    }

    pub(crate) async fn delete_resource_at(
        &self,
        resource: ResourceType,
        mac: Mac,
        deleted_at: i64,
    ) -> Result<()> {
        self.cache.put_tombstone(resource, mac, deleted_at).await
    }

    // -- packfile sets -------------------------------------------------

    pub async fn put_packfile(&self, state_id: Mac, packfile: Mac) -> Result<()> {
        self.cache.put_packfile(state_id, packfile).await
    }

    pub async fn del_packfile(&self, packfile: Mac) -> Result<()> {
        self.cache.del_packfile(packfile).await
    }

    // -- listings ------------------------------------------------------

    pub async fn list_snapshots(&self) -> Result<Vec<Mac>> {
        let mut snapshots = Vec::new();
        for entry in self.cache.list_deltas_of_type(ResourceType::Snapshot).await? {
            if self
                .cache
                .get_tombstone(ResourceType::Snapshot, entry.mac)
                .await?
                .is_none()
            {
                snapshots.push(entry.mac);
            }
        }
        Ok(snapshots)
    }

    pub async fn list_packfiles(&self) -> Result<Vec<Mac>> {
        self.cache.list_packfiles().await
    }

    pub async fn list_deleted_resources(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<(Mac, i64)>> {
        Ok(self
            .cache
            .list_tombstones(Some(resource))
            .await?
            .into_iter()
            .map(|(_, mac, deleted_at)| (mac, deleted_at))
            .collect())
    }

    pub async fn list_objects_of_type(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<DeltaEntry>> {
        self.cache.list_deltas_of_type(resource).await
    }

    pub async fn list_orphan_deltas(&self) -> Result<Vec<DeltaEntry>> {
        self.cache.list_orphan_deltas().await
    }

    // -- serialization and merge --------------------------------------

    /// Emit the on-disk stream: deltas, packfile records and tombstones,
    /// then the metadata trailer.
    pub async fn serialize_to_stream<W: Write>(&self, w: &mut W) -> Result<()> {
        for entry in self.cache.list_deltas().await? {
            serial::write_delta(w, &entry)?;
        }
        for (state_id, packfile) in self.cache.list_packfile_records().await? {
            serial::write_packfile(w, state_id, packfile)?;
        }
        for (resource, mac, deleted_at) in self.cache.list_tombstones(None).await? {
            serial::write_tombstone(w, resource, mac, deleted_at)?;
        }
        serial::write_metadata(w, &self.metadata())?;
        Ok(())
    }

    pub async fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize_to_stream(&mut buf).await?;
        Ok(buf)
    }

    /// Fold a serialized state into this one. Idempotent per `id`: a
    /// state already in the set is skipped.
    pub async fn merge_state(&self, _version: u32, id: Mac, bytes: &[u8]) -> Result<()> {
        if self.cache.has_state(id).await? {
            return Ok(());
        }

        let mut parser = RecordParser::new(bytes);
        while let Some(record) = parser.next()? {
            match record {
                Record::Delta(entry) => self.cache.put_delta(&entry).await?,
                Record::Packfile { state_id, packfile } => {
                    self.cache.put_packfile(state_id, packfile).await?
                }
                Record::Tombstone {
                    resource,
                    mac,
                    deleted_at,
                } => self.cache.put_tombstone(resource, mac, deleted_at).await?,
                Record::Metadata(_) => {}
            }
        }

        self.cache.put_state(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mac: u8, packfile: u8, length: u32) -> DeltaEntry {
        DeltaEntry {
            resource: ResourceType::Chunk,
            version: 1,
            mac: Mac::from_bytes([mac; 32]),
            location: Location {
                packfile: Mac::from_bytes([packfile; 32]),
                offset: 0,
                length,
            },
        }
    }

    async fn fresh() -> LocalState {
        LocalState::new(StateCache::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn tombstone_shadows_delta() {
        let state = fresh().await;
        let e = entry(1, 2, 10);
        state.put_delta(&e).await.unwrap();
        assert!(state.blob_exists(e.resource, e.mac).await.unwrap());

        state.delete_resource(e.resource, e.mac).await.unwrap();
        assert!(!state.blob_exists(e.resource, e.mac).await.unwrap());
        assert_eq!(
            state.get_subpart_for_blob(e.resource, e.mac).await.unwrap(),
            None
        );

        let deleted = state.list_deleted_resources(e.resource).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0, e.mac);
    }

    #[tokio::test]
    async fn serialize_merge_roundtrip() {
        let source = fresh().await;
        source.put_delta(&entry(1, 10, 100)).await.unwrap();
        source.put_delta(&entry(2, 10, 200)).await.unwrap();
        let session = Mac::from_bytes([0xAA; 32]);
        source.put_packfile(session, Mac::from_bytes([10; 32])).await.unwrap();
        source
            .delete_resource(ResourceType::Snapshot, Mac::from_bytes([5; 32]))
            .await
            .unwrap();

        let bytes = source.serialize().await.unwrap();

        let target = fresh().await;
        let id = Mac::from_bytes([0xFF; 32]);
        target.merge_state(STATE_VERSION, id, &bytes).await.unwrap();

        assert!(target.has_state(id).await.unwrap());
        assert!(target
            .blob_exists(ResourceType::Chunk, Mac::from_bytes([1; 32]))
            .await
            .unwrap());
        assert!(target
            .blob_exists(ResourceType::Chunk, Mac::from_bytes([2; 32]))
            .await
            .unwrap());
        assert_eq!(
            target.list_packfiles().await.unwrap(),
            vec![Mac::from_bytes([10; 32])]
        );
        assert!(!target
            .blob_exists(ResourceType::Snapshot, Mac::from_bytes([5; 32]))
            .await
            .unwrap());

        // semantic equality: re-serialization covers the same facts
        let reserialized = target.serialize().await.unwrap();
        let reparsed = fresh().await;
        reparsed
            .merge_state(STATE_VERSION, Mac::from_bytes([0xFE; 32]), &reserialized)
            .await
            .unwrap();
        assert_eq!(
            reparsed.cache.list_deltas().await.unwrap(),
            target.cache.list_deltas().await.unwrap()
        );
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let source = fresh().await;
        source.put_delta(&entry(1, 10, 100)).await.unwrap();
        let bytes = source.serialize().await.unwrap();

        let target = fresh().await;
        let id = Mac::from_bytes([0xFF; 32]);
        target.merge_state(STATE_VERSION, id, &bytes).await.unwrap();
        target.merge_state(STATE_VERSION, id, &bytes).await.unwrap();

        assert_eq!(target.cache.list_deltas().await.unwrap().len(), 1);
        assert_eq!(target.list_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn merge_converges_across_writers() {
        let a = fresh().await;
        a.put_delta(&entry(1, 10, 1)).await.unwrap();
        let b = fresh().await;
        b.put_delta(&entry(2, 20, 2)).await.unwrap();

        let observer = fresh().await;
        observer
            .merge_state(STATE_VERSION, Mac::from_bytes([0xA0; 32]), &a.serialize().await.unwrap())
            .await
            .unwrap();
        observer
            .merge_state(STATE_VERSION, Mac::from_bytes([0xB0; 32]), &b.serialize().await.unwrap())
            .await
            .unwrap();

        assert!(observer
            .blob_exists(ResourceType::Chunk, Mac::from_bytes([1; 32]))
            .await
            .unwrap());
        assert!(observer
            .blob_exists(ResourceType::Chunk, Mac::from_bytes([2; 32]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn serial_is_pinned_only_while_unused() {
        let state = fresh().await;
        let repository_id = Uuid::new_v4();

        state.update_serial_or(repository_id).await.unwrap();
        assert_eq!(state.serial(), repository_id);

        state.put_state(Mac::from_bytes([1; 32])).await.unwrap();
        let other = Uuid::new_v4();
        state.update_serial_or(other).await.unwrap();
        assert_eq!(state.serial(), repository_id);
    }

    #[tokio::test]
    async fn derived_state_is_empty_with_new_serial() {
        let base = fresh().await;
        base.put_delta(&entry(1, 10, 1)).await.unwrap();

        let derived = base.derive(StateCache::in_memory().await.unwrap());
        assert_ne!(derived.serial(), base.serial());
        assert!(!derived
            .blob_exists(ResourceType::Chunk, Mac::from_bytes([1; 32]))
            .await
            .unwrap());
    }
}

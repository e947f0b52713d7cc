//! The inflight dedup index: blobs owned by the packer pipeline but not
//! yet durable. A sharded set with per-shard mutexes; atomic
//! insert-if-absent is its only mutator.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::resource::{Mac, ResourceType};

const SHARD_COUNT: usize = 16;

pub struct InflightIndex {
    shards: Vec<Mutex<HashSet<(ResourceType, Mac)>>>,
}

impl InflightIndex {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashSet::new()))
                .collect(),
        }
    }

    fn shard(&self, mac: &Mac) -> &Mutex<HashSet<(ResourceType, Mac)>> {
        &self.shards[mac.as_bytes()[0] as usize % SHARD_COUNT]
    }

    /// The single dedup primitive. Returns `true` if a prior insertion
    /// existed, in which case the caller drops its copy of the data; the
    /// first caller wins and proceeds to enqueue.
    pub fn insert_if_not_present(&self, resource: ResourceType, mac: Mac) -> bool {
        !self
            .shard(&mac)
            .lock()
            .expect("inflight shard lock")
            .insert((resource, mac))
    }

    /// Release an entry once the packfile carrying the blob is durable,
    /// or when the pipeline gives up on it.
    pub fn remove(&self, resource: ResourceType, mac: Mac) {
        self.shard(&mac)
            .lock()
            .expect("inflight shard lock")
            .remove(&(resource, mac));
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("inflight shard lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InflightIndex {
    fn default() -> Self {
        Self::new()
    }
}

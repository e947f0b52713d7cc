//! In-memory backend, for tests and throwaway repositories.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Backend, BackendError, BackendFactory};
use crate::resource::Mac;

#[derive(Default)]
pub struct MemoryBackend {
    config: Mutex<Option<Vec<u8>>>,
    states: Mutex<HashMap<Mac, Vec<u8>>>,
    packfiles: Mutex<HashMap<Mac, Vec<u8>>>,
    locks: Mutex<HashMap<Mac, Vec<u8>>>,
}

pub struct MemFactory;

impl BackendFactory for MemFactory {
    fn open(&self, _location: &str) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(MemoryBackend::new()))
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn put(map: &Mutex<HashMap<Mac, Vec<u8>>>, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
    // immutable objects, duplicate puts carry identical bytes
    map.lock()
        .expect("backend map lock")
        .entry(mac)
        .or_insert_with(|| data.to_vec());
    Ok(data.len() as u64)
}

fn get(map: &Mutex<HashMap<Mac, Vec<u8>>>, mac: Mac) -> Result<Vec<u8>, BackendError> {
    map.lock()
        .expect("backend map lock")
        .get(&mac)
        .cloned()
        .ok_or(BackendError::NotFound)
}

fn delete(map: &Mutex<HashMap<Mac, Vec<u8>>>, mac: Mac) -> Result<(), BackendError> {
    map.lock()
        .expect("backend map lock")
        .remove(&mac)
        .map(|_| ())
        .ok_or(BackendError::NotFound)
}

fn list(map: &Mutex<HashMap<Mac, Vec<u8>>>) -> Result<Vec<Mac>, BackendError> {
    Ok(map.lock().expect("backend map lock").keys().copied().collect())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, config: &[u8]) -> Result<(), BackendError> {
        let mut slot = self.config.lock().expect("config lock");
        if slot.is_some() {
            return Err(BackendError::AlreadyExists);
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    async fn open(&self) -> Result<Vec<u8>, BackendError> {
        self.config
            .lock()
            .expect("config lock")
            .clone()
            .ok_or(BackendError::NotFound)
    }

    async fn get_states(&self) -> Result<Vec<Mac>, BackendError> {
        list(&self.states)
    }

    async fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        put(&self.states, mac, data)
    }

    async fn get_state(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        get(&self.states, mac)
    }

    async fn delete_state(&self, mac: Mac) -> Result<(), BackendError> {
        delete(&self.states, mac)
    }

    async fn get_packfiles(&self) -> Result<Vec<Mac>, BackendError> {
        list(&self.packfiles)
    }

    async fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        put(&self.packfiles, mac, data)
    }

    async fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        get(&self.packfiles, mac)
    }

    async fn get_packfile_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let data = get(&self.packfiles, mac)?;
        let start = (offset as usize).min(data.len());
        let end = (start + length as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn delete_packfile(&self, mac: Mac) -> Result<(), BackendError> {
        delete(&self.packfiles, mac)
    }

    async fn get_locks(&self) -> Result<Vec<Mac>, BackendError> {
        list(&self.locks)
    }

    async fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        put(&self.locks, mac, data)
    }

    async fn get_lock(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        get(&self.locks, mac)
    }

    async fn delete_lock(&self, mac: Mac) -> Result<(), BackendError> {
        delete(&self.locks, mac)
    }

    async fn size(&self) -> Result<i64, BackendError> {
        let mut total = 0i64;
        for map in [&self.states, &self.packfiles, &self.locks] {
            total += map
                .lock()
                .expect("backend map lock")
                .values()
                .map(|v| v.len() as i64)
                .sum::<i64>();
        }
        if let Some(config) = self.config.lock().expect("config lock").as_ref() {
            total += config.len() as i64;
        }
        Ok(total)
    }
}

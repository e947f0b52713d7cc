//! The object store the repository runs against: a flat, content-addressed
//! map from MAC to opaque bytes in three namespaces (`states/`,
//! `packfiles/`, `locks/`) plus a well-known configuration object.
//!
//! The engine consumes this trait only; it retries nothing and interprets
//! no payload. Failures are reported in four uniform kinds so callers can
//! pick a policy.

pub mod fs;
pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::resource::Mac;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("temporary store failure: {0}")]
    Temporary(std::io::Error),
    #[error("permanent store failure: {0}")]
    Permanent(std::io::Error),
    #[error("unsupported store location {0:?}")]
    UnsupportedLocation(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => BackendError::NotFound,
            ErrorKind::AlreadyExists => BackendError::AlreadyExists,
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                BackendError::Temporary(e)
            }
            _ => BackendError::Permanent(e),
        }
    }
}

/// An eventually-consistent content-addressed object store. All operations
/// must be safe under concurrent callers; objects are immutable once put,
/// so same-MAC put races are benign.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Initialize an empty repository; fails with `AlreadyExists` if one
    /// is already present at this location.
    async fn create(&self, config: &[u8]) -> Result<(), BackendError>;

    /// Return the wrapped configuration blob.
    async fn open(&self) -> Result<Vec<u8>, BackendError>;

    async fn get_states(&self) -> Result<Vec<Mac>, BackendError>;
    async fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError>;
    async fn get_state(&self, mac: Mac) -> Result<Vec<u8>, BackendError>;
    async fn delete_state(&self, mac: Mac) -> Result<(), BackendError>;

    async fn get_packfiles(&self) -> Result<Vec<Mac>, BackendError>;
    async fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError>;
    async fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>, BackendError>;

    /// Range read inside a packfile object. Offsets are absolute within
    /// the stored object, envelope header included. A range reaching past
    /// the end of the object returns the bytes that exist.
    async fn get_packfile_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> Result<Vec<u8>, BackendError>;

    async fn delete_packfile(&self, mac: Mac) -> Result<(), BackendError>;

    async fn get_locks(&self) -> Result<Vec<Mac>, BackendError>;
    async fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError>;
    async fn get_lock(&self, mac: Mac) -> Result<Vec<u8>, BackendError>;
    async fn delete_lock(&self, mac: Mac) -> Result<(), BackendError>;

    /// Best-effort total byte count of the store.
    async fn size(&self) -> Result<i64, BackendError>;
}

/// Creates a backend from the location string following its scheme.
pub trait BackendFactory: Send + Sync {
    fn open(&self, location: &str) -> Result<Arc<dyn Backend>, BackendError>;
}

/// Explicit scheme → factory map handed to open/create. Kept as a value
/// rather than process-wide state so tests can compose their own.
pub struct Registry {
    factories: HashMap<String, Box<dyn BackendFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The built-in schemes: `fs` (also the default for bare paths) and
    /// `mem`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("fs", Box::new(fs::FsFactory));
        registry.register("mem", Box::new(mem::MemFactory));
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: Box<dyn BackendFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    pub fn instantiate(&self, location: &str) -> Result<Arc<dyn Backend>, BackendError> {
        let (scheme, rest) = location.split_once("://").unwrap_or(("fs", location));
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| BackendError::UnsupportedLocation(location.to_string()))?;
        factory.open(rest)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_schemes() {
        let registry = Registry::with_defaults();
        assert!(registry.instantiate("mem://").is_ok());
        assert!(registry.instantiate("/tmp/somewhere").is_ok());
        assert!(matches!(
            registry.instantiate("s3://bucket"),
            Err(BackendError::UnsupportedLocation(_))
        ));
    }

    #[test]
    fn io_errors_classify() {
        use std::io::{Error as IoError, ErrorKind};
        assert!(matches!(
            BackendError::from(IoError::new(ErrorKind::NotFound, "x")),
            BackendError::NotFound
        ));
        assert!(matches!(
            BackendError::from(IoError::new(ErrorKind::TimedOut, "x")),
            BackendError::Temporary(_)
        ));
        assert!(matches!(
            BackendError::from(IoError::new(ErrorKind::PermissionDenied, "x")),
            BackendError::Permanent(_)
        ));
    }
}

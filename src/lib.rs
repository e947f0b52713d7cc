//! # coffer
//!
//! A content-addressed, deduplicating backup repository engine. Clients
//! chunk file data, put immutable typed blobs, and commit states mapping
//! every blob to its packfile location; any committed snapshot can be
//! recovered by walking the aggregated state. Multiple writers may share
//! one repository concurrently: each publishes its own state objects and
//! readers merge the union at open.
//!
//! The pieces, bottom up:
//!
//! - [`backend`]: the pluggable object store (packfiles, states, locks)
//! - [`codec`]: compression + AEAD pipeline and the storage envelope
//! - [`hashing`]: keyed MACs serving as content addresses
//! - [`chunker`]: content-defined splitting of file streams
//! - [`packfile`]: the packfile binary format
//! - [`packer`]: the concurrent blob-to-packfile pipeline
//! - [`state`]: the local blob index, tombstones and merge semantics
//! - [`repository`]: the facade tying everything together

pub mod backend;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod error;
pub mod hashing;
pub mod packer;
pub mod packfile;
pub mod repository;
pub mod resource;
pub mod state;

pub use backend::{Backend, BackendError, Registry};
pub use chunker::{Chunk, Chunker};
pub use config::RepositoryConfig;
pub use error::{Error, Result};
pub use repository::{Repository, Transaction};
pub use resource::{Blob, Location, Mac, ResourceType};
pub use state::{CacheProvider, LocalState, StateCache};

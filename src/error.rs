use crate::backend::BackendError;
use crate::resource::{Mac, ResourceType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed storage envelope")]
    MalformedEnvelope,
    #[error("resource type mismatch: expected {expected}, found {found}")]
    ResourceTypeMismatch {
        expected: ResourceType,
        found: u32,
    },
    #[error("integrity check failed")]
    IntegrityFailure,
    #[error("packfile index does not match its footer")]
    IndexMismatch,
    #[error("malformed state stream")]
    MalformedState,
    #[error("{resource} blob {mac} not found")]
    BlobNotFound { resource: ResourceType, mac: Mac },
    #[error("invalid repository configuration: {0}")]
    ConfigInvalid(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("transaction is no longer usable")]
    TransactionClosed,
    #[error("packer pipeline failed: {0}")]
    Packer(String),
    #[error("data decryption/encryption error")]
    Crypto(#[from] aes_gcm::Error),
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Getrandom(#[from] getrandom::Error),
    #[error("{0}")]
    Chunker(#[from] fastcdc::v2020::Error),
    #[error("{0}")]
    Cache(#[from] sqlx::Error),
    #[error("configuration encode failed: {0}")]
    ConfigEncode(#[from] rmp_serde::encode::Error),
    #[error("configuration decode failed: {0}")]
    ConfigDecode(#[from] rmp_serde::decode::Error),
}

impl Error {
    /// Whether the blob lookup merely missed, as opposed to failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlobNotFound { .. } | Error::Backend(BackendError::NotFound)
        )
    }
}

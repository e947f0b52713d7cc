//! The repository configuration blob: created once, stored at the
//! backend's well-known key wrapped in the storage envelope, and read back
//! on every open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::resource::Mac;

pub const DEFAULT_PACKFILE_MAX_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_CHUNK_MIN_SIZE: u64 = 64 * 1024;
pub const DEFAULT_CHUNK_NORMAL_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 4 * 1024 * 1024;

pub const HASHING_ALGORITHM: &str = "BLAKE3";
pub const CHUNKING_ALGORITHM: &str = "FASTCDC";
pub const COMPRESSION_ALGORITHM: &str = "ZSTD";
pub const ENCRYPTION_DATA_ALGORITHM: &str = "AES256-GCM";
pub const ENCRYPTION_SUBKEY_ALGORITHM: &str = "HKDF-SHA256";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub repository_id: Uuid,
    pub packfile: PackfileConfig,
    pub chunking: ChunkingConfig,
    pub hashing: HashingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PackfileConfig {
    pub max_size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub algorithm: String,
    pub min_size: u64,
    pub normal_size: u64,
    pub max_size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashingConfig {
    pub algorithm: String,
    pub bits: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: String,
    pub level: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub data_algorithm: String,
    pub subkey_algorithm: String,
    #[serde(with = "serde_bytes")]
    pub canary: Vec<u8>,
    pub kdf_params: KdfParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KdfParams {
    pub kdf: String,
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
}

impl RepositoryConfig {
    /// A fresh configuration with a random repository identifier and the
    /// default parameters: no compression, no encryption, BLAKE3 hashing,
    /// FastCDC 64 KiB / 1 MiB / 4 MiB chunking and 20 MiB packfiles.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            repository_id: Uuid::new_v4(),
            packfile: PackfileConfig {
                max_size: DEFAULT_PACKFILE_MAX_SIZE,
            },
            chunking: ChunkingConfig {
                algorithm: CHUNKING_ALGORITHM.to_string(),
                min_size: DEFAULT_CHUNK_MIN_SIZE,
                normal_size: DEFAULT_CHUNK_NORMAL_SIZE,
                max_size: DEFAULT_CHUNK_MAX_SIZE,
            },
            hashing: HashingConfig {
                algorithm: HASHING_ALGORITHM.to_string(),
                bits: 256,
            },
            compression: None,
            encryption: None,
        }
    }

    /// Turn on compression with the given zstd level.
    pub fn enable_compression(&mut self, level: i32) {
        self.compression = Some(CompressionConfig {
            algorithm: COMPRESSION_ALGORITHM.to_string(),
            level,
        });
    }

    /// Turn on encryption. The canary is filled in at create time, once
    /// the key set has been derived from the user secret.
    pub fn enable_encryption(&mut self, salt: Vec<u8>) {
        self.encryption = Some(EncryptionConfig {
            data_algorithm: ENCRYPTION_DATA_ALGORITHM.to_string(),
            subkey_algorithm: ENCRYPTION_SUBKEY_ALGORITHM.to_string(),
            canary: Vec::new(),
            kdf_params: KdfParams {
                kdf: ENCRYPTION_SUBKEY_ALGORITHM.to_string(),
                salt,
            },
        });
    }

    pub(crate) fn set_canary(&mut self, canary: Mac) {
        if let Some(enc) = &mut self.encryption {
            enc.canary = canary.as_bytes().to_vec();
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let config: Self = rmp_serde::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.packfile.max_size == 0 {
            return Err(Error::ConfigInvalid("packfile.max_size must be non-zero".into()));
        }
        if !self.chunking.algorithm.eq_ignore_ascii_case(CHUNKING_ALGORITHM) {
            return Err(Error::ConfigInvalid(format!(
                "unsupported chunking algorithm {:?}",
                self.chunking.algorithm
            )));
        }
        if self.chunking.min_size == 0
            || self.chunking.min_size > self.chunking.normal_size
            || self.chunking.normal_size > self.chunking.max_size
        {
            return Err(Error::ConfigInvalid(
                "chunking sizes must satisfy 0 < min <= normal <= max".into(),
            ));
        }
        // hard limits of the chunking algorithm
        if self.chunking.min_size < 64
            || self.chunking.normal_size < 256
            || self.chunking.max_size < 1024
            || self.chunking.max_size > 1_073_741_824
        {
            return Err(Error::ConfigInvalid(
                "chunking sizes exceed the algorithm's limits".into(),
            ));
        }
        if !self.hashing.algorithm.eq_ignore_ascii_case(HASHING_ALGORITHM)
            || self.hashing.bits != 256
        {
            return Err(Error::ConfigInvalid(format!(
                "unsupported hashing algorithm {:?}/{}",
                self.hashing.algorithm, self.hashing.bits
            )));
        }
        if let Some(compression) = &self.compression {
            if !compression.algorithm.eq_ignore_ascii_case(COMPRESSION_ALGORITHM) {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported compression algorithm {:?}",
                    compression.algorithm
                )));
            }
        }
        if let Some(encryption) = &self.encryption {
            if !encryption.data_algorithm.eq_ignore_ascii_case(ENCRYPTION_DATA_ALGORITHM) {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported encryption algorithm {:?}",
                    encryption.data_algorithm
                )));
            }
            if !encryption
                .subkey_algorithm
                .eq_ignore_ascii_case(ENCRYPTION_SUBKEY_ALGORITHM)
            {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported subkey algorithm {:?}",
                    encryption.subkey_algorithm
                )));
            }
            if encryption.kdf_params.salt.is_empty() {
                return Err(Error::ConfigInvalid("empty KDF salt".into()));
            }
        }
        Ok(())
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_roundtrip() {
        let mut config = RepositoryConfig::new();
        config.enable_compression(3);
        config.enable_encryption(vec![7u8; 32]);
        config.set_canary(Mac::from_bytes([9u8; 32]));

        let bytes = config.serialize().unwrap();
        let parsed = RepositoryConfig::deserialize(&bytes).unwrap();

        assert_eq!(parsed.repository_id, config.repository_id);
        assert_eq!(parsed.packfile.max_size, config.packfile.max_size);
        assert_eq!(parsed.encryption.as_ref().unwrap().canary, vec![9u8; 32]);
        assert_eq!(parsed.encryption.unwrap().kdf_params.salt, vec![7u8; 32]);
    }

    #[test]
    fn zero_packfile_size_is_rejected() {
        let mut config = RepositoryConfig::new();
        config.packfile.max_size = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn chunking_bounds_are_checked() {
        let mut config = RepositoryConfig::new();
        config.chunking.min_size = config.chunking.max_size + 1;
        assert!(config.validate().is_err());

        let mut config = RepositoryConfig::new();
        config.chunking.min_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_algorithms_are_rejected() {
        let mut config = RepositoryConfig::new();
        config.hashing.algorithm = "SHA1".into();
        assert!(config.validate().is_err());
    }
}

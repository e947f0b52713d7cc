//! The stream codec applied to every blob, state and lock payload:
//! optional compression followed by optional AEAD encryption, inverse on
//! read. The pipeline is composed once at open time from the repository
//! configuration and is stateless between calls; every encode starts a
//! fresh AEAD frame with a fresh random nonce.

pub mod envelope;

use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit, Nonce};

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::hashing::Keys;

pub const NONCE_SIZE: usize = 12;

#[derive(Clone)]
pub struct Pipeline {
    compression: Option<i32>,
    cipher: Option<Aes256Gcm>,
}

impl Pipeline {
    pub fn from_config(config: &RepositoryConfig, keys: &Keys) -> Result<Self> {
        let cipher = match (&config.encryption, keys.data_key()) {
            (Some(_), Some(key)) => Some(Aes256Gcm::new(key.into())),
            (Some(_), None) => {
                return Err(Error::ConfigInvalid(
                    "encrypted repository opened without a data key".into(),
                ))
            }
            (None, _) => None,
        };

        Ok(Self {
            compression: config.compression.as_ref().map(|c| c.level),
            cipher,
        })
    }

    /// A pass-through pipeline; what an unencrypted, uncompressed
    /// repository runs.
    pub fn passthrough() -> Self {
        Self {
            compression: None,
            cipher: None,
        }
    }

    /// plaintext -> deflate -> AEAD, returning `nonce || ciphertext` when
    /// encryption is on.
    pub fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut data = match self.compression {
            Some(level) => zstd::stream::encode_all(plain, level)?,
            None => plain.to_vec(),
        };

        if let Some(cipher) = &self.cipher {
            let mut nonce_bytes = [0u8; NONCE_SIZE];
            getrandom::getrandom(&mut nonce_bytes)?;
            let nonce = Nonce::from_slice(&nonce_bytes);
            cipher.encrypt_in_place(nonce, b"", &mut data)?;

            let mut framed = Vec::with_capacity(NONCE_SIZE + data.len());
            framed.extend_from_slice(&nonce_bytes);
            framed.append(&mut data);
            data = framed;
        }

        Ok(data)
    }

    /// Inverse of [`Pipeline::encode`].
    pub fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let mut data = match &self.cipher {
            Some(cipher) => {
                if encoded.len() < NONCE_SIZE {
                    return Err(Error::Crypto(aes_gcm::Error));
                }
                let (nonce_bytes, ciphertext) = encoded.split_at(NONCE_SIZE);
                let mut buf = ciphertext.to_vec();
                cipher.decrypt_in_place(Nonce::from_slice(nonce_bytes), b"", &mut buf)?;
                buf
            }
            None => encoded.to_vec(),
        };

        if self.compression.is_some() {
            data = zstd::stream::decode_all(&data[..])?;
        }

        Ok(data)
    }

    /// Reader form of [`Pipeline::encode`]; drains the source first, as
    /// each call is a single AEAD frame.
    pub fn encode_reader<R: std::io::Read>(&self, mut source: R) -> Result<Vec<u8>> {
        let mut plain = Vec::new();
        source.read_to_end(&mut plain)?;
        self.encode(&plain)
    }

    /// Reader form of [`Pipeline::decode`].
    pub fn decode_reader<R: std::io::Read>(&self, mut source: R) -> Result<Vec<u8>> {
        let mut encoded = Vec::new();
        source.read_to_end(&mut encoded)?;
        self.decode(&encoded)
    }
}

//! Key derivation and hashing. Two functions are derived from the
//! configured algorithm: a plain hasher for places where no key is
//! available (the packfile index MAC) and a keyed MAC for content
//! addresses and envelope seals.

use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::resource::{Mac, MAC_SIZE};

pub type SymmetricKey = [u8; 32];

const SUBKEY_INFO_MAC: &[u8] = b"mac";
const SUBKEY_INFO_DATA: &[u8] = b"data";
const SUBKEY_INFO_CANARY: &[u8] = b"canary";

/// Key material of an open repository. The MAC key addresses content and
/// seals envelopes; the data key, present only on encrypted repositories,
/// feeds the AEAD stage of the codec pipeline.
#[derive(Clone)]
pub struct Keys {
    mac_key: SymmetricKey,
    data_key: Option<SymmetricKey>,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keys")
    }
}

impl Keys {
    /// Derive the key set for a repository. Encrypted repositories expand
    /// subkeys from the user secret with HKDF-SHA256 and the configured
    /// salt; plaintext repositories key the MAC with a hash of the
    /// repository identifier.
    pub fn derive(config: &RepositoryConfig, secret: Option<&[u8]>) -> Result<Self> {
        match (&config.encryption, secret) {
            (Some(enc), Some(secret)) => {
                let kdf = Hkdf::<Sha256>::new(Some(&enc.kdf_params.salt), secret);
                Ok(Self {
                    mac_key: expand(&kdf, SUBKEY_INFO_MAC),
                    data_key: Some(expand(&kdf, SUBKEY_INFO_DATA)),
                })
            }
            (Some(_), None) => Err(Error::ConfigInvalid(
                "repository is encrypted, a secret is required".into(),
            )),
            (None, _) => Ok(Self {
                mac_key: *blake3::hash(config.repository_id.as_bytes()).as_bytes(),
                data_key: None,
            }),
        }
    }

    /// Key set for a repository that has not been configured yet; only
    /// valid for plaintext repositories.
    pub fn for_repository_id(repository_id: Uuid) -> Self {
        Self {
            mac_key: *blake3::hash(repository_id.as_bytes()).as_bytes(),
            data_key: None,
        }
    }

    /// The canary stored in the configuration of encrypted repositories,
    /// checked at open to reject a wrong secret early.
    pub fn canary(&self) -> Mac {
        self.compute_mac(SUBKEY_INFO_CANARY)
    }

    pub fn data_key(&self) -> Option<&SymmetricKey> {
        self.data_key.as_ref()
    }

    /// Keyed MAC over `data`; the content address of a blob plaintext and
    /// the backend key of a serialized packfile.
    pub fn compute_mac(&self, data: &[u8]) -> Mac {
        Mac::from_bytes(*blake3::keyed_hash(&self.mac_key, data).as_bytes())
    }

    /// Incremental form of [`Keys::compute_mac`].
    pub fn mac_hasher(&self) -> MacHasher {
        MacHasher(blake3::Hasher::new_keyed(&self.mac_key))
    }
}

/// Plain (unkeyed) hasher; used where no key is available, e.g. the index
/// MAC inside a packfile footer.
pub fn hasher() -> blake3::Hasher {
    blake3::Hasher::new()
}

/// Plain hash of `data` as a [`Mac`]-shaped value.
pub fn hash(data: &[u8]) -> Mac {
    Mac::from_bytes(*blake3::hash(data).as_bytes())
}

pub struct MacHasher(blake3::Hasher);

impl MacHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Mac {
        Mac::from_bytes(*self.0.finalize().as_bytes())
    }
}

fn expand(kdf: &Hkdf<Sha256>, info: &[u8]) -> SymmetricKey {
    let mut output: SymmetricKey = Default::default();
    // 32 bytes is always a valid HKDF-SHA256 output length
    kdf.expand(info, &mut output).expect("subkey length");
    output
}

/// Random salt for a fresh encrypted repository.
pub fn generate_salt() -> Result<Vec<u8>> {
    let mut salt = vec![0u8; MAC_SIZE];
    getrandom::getrandom(&mut salt)?;
    Ok(salt)
}

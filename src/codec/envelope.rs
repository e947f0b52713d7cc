//! The storage envelope: the common outer framing around config, state,
//! lock and packfile objects.
//!
//! ```text
//! magic "_PLAKAR_" | type:u32 LE | version:u32 LE | ... inner ... | seal:32
//! ```
//!
//! The seal is a keyed MAC over everything before it. The inner bytes are
//! whatever the codec pipeline produced; the envelope itself adds no
//! encryption.

use crate::error::{Error, Result};
use crate::hashing::Keys;
use crate::resource::{Mac, ResourceType, MAC_SIZE};

pub const MAGIC: &[u8; 8] = b"_PLAKAR_";
pub const HEADER_SIZE: usize = MAGIC.len() + 4 + 4;
pub const TRAILER_SIZE: usize = MAC_SIZE;

/// Wrap `inner` for storage under the given resource type.
pub fn wrap(keys: &Keys, resource: ResourceType, version: u32, inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + inner.len() + TRAILER_SIZE);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&resource.as_u32().to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(inner);

    let mut hasher = keys.mac_hasher();
    hasher.update(&out);
    let seal = hasher.finalize();
    out.extend_from_slice(seal.as_bytes());
    out
}

/// A parsed but not yet authenticated envelope. Parsing and verification
/// are split because the configuration blob must be parsed before the key
/// set verifying it can exist.
pub struct Envelope<'a> {
    pub version: u32,
    pub inner: &'a [u8],
    sealed: &'a [u8],
    seal: Mac,
}

impl<'a> Envelope<'a> {
    pub fn parse(expected: ResourceType, bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::MalformedEnvelope);
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::MalformedEnvelope);
        }

        let found = u32::from_le_bytes(bytes[8..12].try_into().expect("header slice"));
        if found != expected.as_u32() {
            return Err(Error::ResourceTypeMismatch { expected, found });
        }
        let version = u32::from_le_bytes(bytes[12..16].try_into().expect("header slice"));

        let seal_at = bytes.len() - TRAILER_SIZE;
        Ok(Self {
            version,
            inner: &bytes[HEADER_SIZE..seal_at],
            sealed: &bytes[..seal_at],
            seal: Mac::from_slice(&bytes[seal_at..])?,
        })
    }

    pub fn verify(&self, keys: &Keys) -> Result<()> {
        let mut hasher = keys.mac_hasher();
        hasher.update(self.sealed);
        if hasher.finalize() != self.seal {
            return Err(Error::IntegrityFailure);
        }
        Ok(())
    }
}

/// Parse and authenticate in one step; the common case for everything but
/// the configuration blob.
pub fn unwrap<'a>(
    keys: &Keys,
    expected: ResourceType,
    bytes: &'a [u8],
) -> Result<(u32, &'a [u8])> {
    let envelope = Envelope::parse(expected, bytes)?;
    envelope.verify(keys)?;
    Ok((envelope.version, envelope.inner))
}

//! Core identifiers shared by every layer: resource types, 32-byte MACs
//! and blob locations inside packfiles.

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of a MAC in bytes.
pub const MAC_SIZE: usize = 32;

/// Format version stamped on every serialized resource.
pub const RESOURCE_FORMAT_VERSION: u32 = 1;

/// A 32-byte keyed hash, serving both as content address and integrity tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Mac(#[serde(with = "serde_bytes_array")] pub [u8; MAC_SIZE]);

// serde_bytes does not cover fixed-size arrays directly, so bridge through
// a slice the way the config's other byte fields are handled.
mod serde_bytes_array {
    use serde::{de::Error as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(&bytes[..], ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = serde_bytes::deserialize(de)?;
        buf.try_into().map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

impl Mac {
    pub const ZERO: Mac = Mac([0u8; MAC_SIZE]);

    pub fn from_bytes(bytes: [u8; MAC_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; MAC_SIZE] =
            bytes.try_into().map_err(|_| Error::MalformedEnvelope)?;
        Ok(Self(arr))
    }

    /// A fresh random MAC; used for padding blobs, which have no content
    /// address of their own.
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; MAC_SIZE];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", hex::encode(self.0))
    }
}

/// The closed set of blob kinds a repository stores. `Random` exists only
/// for padding and is never referenced by any state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResourceType {
    Config = 1,
    Snapshot = 2,
    Chunk = 3,
    Object = 4,
    Vfs = 5,
    VfsEntry = 6,
    VfsBtreeRoot = 7,
    VfsBtreeNode = 8,
    Xattr = 9,
    XattrBtreeRoot = 10,
    XattrBtreeNode = 11,
    ContentType = 12,
    ContentTypeBtreeRoot = 13,
    ContentTypeBtreeNode = 14,
    Signature = 15,
    Error = 16,
    Lock = 17,
    State = 18,
    Packfile = 19,
    Random = 20,
}

impl ResourceType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        use ResourceType::*;
        Ok(match value {
            1 => Config,
            2 => Snapshot,
            3 => Chunk,
            4 => Object,
            5 => Vfs,
            6 => VfsEntry,
            7 => VfsBtreeRoot,
            8 => VfsBtreeNode,
            9 => Xattr,
            10 => XattrBtreeRoot,
            11 => XattrBtreeNode,
            12 => ContentType,
            13 => ContentTypeBtreeRoot,
            14 => ContentTypeBtreeNode,
            15 => Signature,
            16 => Error,
            17 => Lock,
            18 => State,
            19 => Packfile,
            20 => Random,
            _ => return Err(crate::error::Error::MalformedEnvelope),
        })
    }

    /// Serialization version of this resource kind.
    pub fn version(self) -> u32 {
        RESOURCE_FORMAT_VERSION
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Config => "config",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Chunk => "chunk",
            ResourceType::Object => "object",
            ResourceType::Vfs => "vfs",
            ResourceType::VfsEntry => "vfs entry",
            ResourceType::VfsBtreeRoot => "vfs btree root",
            ResourceType::VfsBtreeNode => "vfs btree node",
            ResourceType::Xattr => "xattr",
            ResourceType::XattrBtreeRoot => "xattr btree root",
            ResourceType::XattrBtreeNode => "xattr btree node",
            ResourceType::ContentType => "content type",
            ResourceType::ContentTypeBtreeRoot => "content type btree root",
            ResourceType::ContentTypeBtreeNode => "content type btree node",
            ResourceType::Signature => "signature",
            ResourceType::Error => "error",
            ResourceType::Lock => "lock",
            ResourceType::State => "state",
            ResourceType::Packfile => "packfile",
            ResourceType::Random => "random",
        };
        f.write_str(name)
    }
}

/// Where a blob lives: which packfile, and the byte range inside its
/// serialized layout (the storage envelope header is not counted).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Location {
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

/// An immutable typed payload, identified by `(resource, mac)`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Blob {
    pub resource: ResourceType,
    pub version: u32,
    pub mac: Mac,
    pub data: Vec<u8>,
}

/// Seconds since the Unix epoch; the timestamp format of every on-disk
/// record.
pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_roundtrip() {
        for raw in 1..=20u32 {
            let rtype = ResourceType::from_u32(raw).unwrap();
            assert_eq!(rtype.as_u32(), raw);
        }
        assert!(ResourceType::from_u32(0).is_err());
        assert!(ResourceType::from_u32(21).is_err());
    }

    #[test]
    fn mac_hex_display() {
        let mac = Mac::from_bytes([0xab; 32]);
        assert_eq!(mac.to_string(), "ab".repeat(32));
    }

    #[test]
    fn random_macs_differ() {
        assert_ne!(Mac::random().unwrap(), Mac::random().unwrap());
    }
}

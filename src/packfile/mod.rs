//! The packfile binary format. A packfile concatenates encoded blobs,
//! then an encoded index, then an encoded footer, then the length of that
//! encoded footer:
//!
//! ```text
//! [ data region: concatenated encoded blobs        ]
//! [ encoded index: N x BlobIndexEntry (56 B each)  ]
//! [ encoded footer: PackFooter (56 B)              ]
//! [ footer_length: u32 LE                          ]
//! ```
//!
//! The index MAC in the footer is a plain hash of the raw index bytes
//! before encoding; the whole stream is wrapped in the storage envelope
//! by the flusher before upload.

pub mod pack;
pub mod unpack;

pub use pack::PackWriter;
pub use unpack::PackReader;

use crate::error::{Error, Result};
use crate::resource::{Mac, ResourceType};

pub const INDEX_ENTRY_SIZE: usize = 56;
pub const FOOTER_SIZE: usize = 56;

/// One blob recorded in a packfile index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlobIndexEntry {
    pub resource: ResourceType,
    pub version: u32,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

impl BlobIndexEntry {
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut out = [0u8; INDEX_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.resource.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..40].copy_from_slice(self.mac.as_bytes());
        out[40..48].copy_from_slice(&self.offset.to_le_bytes());
        out[48..52].copy_from_slice(&self.length.to_le_bytes());
        out[52..56].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != INDEX_ENTRY_SIZE {
            return Err(Error::IndexMismatch);
        }
        let raw_type = u32::from_le_bytes(bytes[0..4].try_into().expect("entry slice"));
        Ok(Self {
            resource: ResourceType::from_u32(raw_type).map_err(|_| Error::IndexMismatch)?,
            version: u32::from_le_bytes(bytes[4..8].try_into().expect("entry slice")),
            mac: Mac::from_slice(&bytes[8..40]).map_err(|_| Error::IndexMismatch)?,
            offset: u64::from_le_bytes(bytes[40..48].try_into().expect("entry slice")),
            length: u32::from_le_bytes(bytes[48..52].try_into().expect("entry slice")),
            flags: u32::from_le_bytes(bytes[52..56].try_into().expect("entry slice")),
        })
    }
}

/// The packfile trailer, encoded after the index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PackFooter {
    pub timestamp: i64,
    pub count: u32,
    pub index_offset: u64,
    pub index_mac: Mac,
    pub flags: u32,
}

impl PackFooter {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.count.to_le_bytes());
        out[12..20].copy_from_slice(&self.index_offset.to_le_bytes());
        out[20..52].copy_from_slice(self.index_mac.as_bytes());
        out[52..56].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FOOTER_SIZE {
            return Err(Error::IndexMismatch);
        }
        Ok(Self {
            timestamp: i64::from_le_bytes(bytes[0..8].try_into().expect("footer slice")),
            count: u32::from_le_bytes(bytes[8..12].try_into().expect("footer slice")),
            index_offset: u64::from_le_bytes(bytes[12..20].try_into().expect("footer slice")),
            index_mac: Mac::from_slice(&bytes[20..52]).map_err(|_| Error::IndexMismatch)?,
            flags: u32::from_le_bytes(bytes[52..56].try_into().expect("footer slice")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MAC_SIZE;

    #[test]
    fn index_entry_layout() {
        let entry = BlobIndexEntry {
            resource: ResourceType::Chunk,
            version: 1,
            mac: Mac::from_bytes([0x11; MAC_SIZE]),
            offset: 0xDEAD_BEEF,
            length: 1234,
            flags: 7,
        };
        let encoded = entry.encode();
        assert_eq!(encoded.len(), INDEX_ENTRY_SIZE);
        assert_eq!(BlobIndexEntry::decode(&encoded).unwrap(), entry);
    }

    #[test]
    fn footer_layout() {
        let footer = PackFooter {
            timestamp: 1_700_000_000,
            count: 3,
            index_offset: 4096,
            index_mac: Mac::from_bytes([0x22; MAC_SIZE]),
            flags: 0,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(PackFooter::decode(&encoded).unwrap(), footer);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(BlobIndexEntry::decode(&[0u8; 10]).is_err());
        assert!(PackFooter::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn unknown_resource_type_is_rejected() {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            BlobIndexEntry::decode(&bytes),
            Err(Error::IndexMismatch)
        ));
    }
}

//! Building packfiles blob by blob.

use crate::codec::Pipeline;
use crate::error::{Error, Result};
use crate::hashing;
use crate::packfile::{BlobIndexEntry, PackFooter};
use crate::resource::{Mac, ResourceType};

/// Accumulates encoded blobs and their index entries; `finalize` seals the
/// stream into the on-disk layout. The data region lives in memory, which
/// the packer bounds by `packfile.max_size`.
pub struct PackWriter {
    data: Vec<u8>,
    entries: Vec<BlobIndexEntry>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Append one already-encoded blob and record its index entry at the
    /// current offset.
    pub fn write_blob(
        &mut self,
        resource: ResourceType,
        version: u32,
        mac: Mac,
        encoded: &[u8],
        flags: u32,
    ) -> &BlobIndexEntry {
        let entry = BlobIndexEntry {
            resource,
            version,
            mac,
            offset: self.data.len() as u64,
            length: encoded.len() as u32,
            flags,
        };
        self.data.extend_from_slice(encoded);
        self.entries.push(entry);
        self.entries.last().expect("entry just pushed")
    }

    /// Size of the data region so far; what the packer compares against
    /// `packfile.max_size`.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[BlobIndexEntry] {
        &self.entries
    }

    /// Serialize the index (hashing the raw bytes as they stream out),
    /// encode index and footer, and append the trailing footer length.
    /// Returns the serialized packfile and the entries it carries.
    /// Empty packfiles are never produced.
    pub fn finalize(
        self,
        pipeline: &Pipeline,
        timestamp: i64,
        flags: u32,
    ) -> Result<(Vec<u8>, Vec<BlobIndexEntry>)> {
        if self.entries.is_empty() {
            return Err(Error::Packer("refusing to finalize an empty packfile".into()));
        }

        let mut raw_index = Vec::with_capacity(self.entries.len() * super::INDEX_ENTRY_SIZE);
        let mut index_hasher = hashing::hasher();
        for entry in &self.entries {
            let encoded = entry.encode();
            index_hasher.update(&encoded);
            raw_index.extend_from_slice(&encoded);
        }
        let index_mac = Mac::from_bytes(*index_hasher.finalize().as_bytes());

        let footer = PackFooter {
            timestamp,
            count: self.entries.len() as u32,
            index_offset: self.data.len() as u64,
            index_mac,
            flags,
        };

        let encoded_index = pipeline.encode(&raw_index)?;
        let encoded_footer = pipeline.encode(&footer.encode())?;

        let mut out = self.data;
        out.reserve(encoded_index.len() + encoded_footer.len() + 4);
        out.extend_from_slice(&encoded_index);
        out.extend_from_slice(&encoded_footer);
        out.extend_from_slice(&(encoded_footer.len() as u32).to_le_bytes());

        Ok((out, self.entries))
    }

    /// Discard the in-progress stream.
    pub fn abort(self) {}
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

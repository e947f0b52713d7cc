//! Reading packfiles back: parse the trailer, verify the index against
//! its footer MAC, expose indexed random access.

use crate::codec::Pipeline;
use crate::error::{Error, Result};
use crate::hashing;
use crate::packfile::{BlobIndexEntry, PackFooter, INDEX_ENTRY_SIZE};
use crate::resource::{Mac, ResourceType};

pub struct PackReader {
    data: Vec<u8>,
    footer: PackFooter,
    entries: Vec<BlobIndexEntry>,
}

impl PackReader {
    /// Parse a serialized packfile (envelope already removed). The index
    /// is decoded and checked against the footer's `index_mac`; a
    /// disagreement is an integrity failure for the whole packfile.
    pub fn parse(data: Vec<u8>, pipeline: &Pipeline) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::IndexMismatch);
        }

        let footer_len =
            u32::from_le_bytes(data[data.len() - 4..].try_into().expect("trailer slice"))
                as usize;
        let Some(footer_start) = data.len().checked_sub(4 + footer_len) else {
            return Err(Error::IndexMismatch);
        };

        let raw_footer = pipeline.decode(&data[footer_start..data.len() - 4])?;
        let footer = PackFooter::decode(&raw_footer)?;

        let index_start = footer.index_offset as usize;
        if index_start > footer_start {
            return Err(Error::IndexMismatch);
        }

        let raw_index = pipeline.decode(&data[index_start..footer_start])?;
        let mut index_hasher = hashing::hasher();
        index_hasher.update(&raw_index);
        if Mac::from_bytes(*index_hasher.finalize().as_bytes()) != footer.index_mac {
            return Err(Error::IntegrityFailure);
        }

        if raw_index.len() % INDEX_ENTRY_SIZE != 0
            || raw_index.len() / INDEX_ENTRY_SIZE != footer.count as usize
        {
            return Err(Error::IndexMismatch);
        }

        let mut entries = Vec::with_capacity(footer.count as usize);
        for raw_entry in raw_index.chunks_exact(INDEX_ENTRY_SIZE) {
            let entry = BlobIndexEntry::decode(raw_entry)?;
            // blob ranges must stay inside the data region
            if entry
                .offset
                .checked_add(u64::from(entry.length))
                .map_or(true, |end| end > footer.index_offset)
            {
                return Err(Error::IndexMismatch);
            }
            entries.push(entry);
        }

        Ok(Self {
            data,
            footer,
            entries,
        })
    }

    pub fn footer(&self) -> &PackFooter {
        &self.footer
    }

    pub fn entries(&self) -> &[BlobIndexEntry] {
        &self.entries
    }

    pub fn find(&self, resource: ResourceType, mac: Mac) -> Option<&BlobIndexEntry> {
        self.entries
            .iter()
            .find(|e| e.resource == resource && e.mac == mac)
    }

    /// Decode one blob out of the data region.
    pub fn blob(&self, entry: &BlobIndexEntry, pipeline: &Pipeline) -> Result<Vec<u8>> {
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        pipeline.decode(&self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packfile::PackWriter;

    fn sample_packfile(pipeline: &Pipeline) -> Vec<u8> {
        let mut writer = PackWriter::new();
        writer.write_blob(
            ResourceType::Chunk,
            1,
            Mac::from_bytes([1; 32]),
            &pipeline.encode(b"first blob").unwrap(),
            0,
        );
        writer.write_blob(
            ResourceType::Object,
            1,
            Mac::from_bytes([2; 32]),
            &pipeline.encode(b"second").unwrap(),
            0,
        );
        writer.finalize(pipeline, 7, 0).unwrap().0
    }

    #[test]
    fn roundtrip_random_access() {
        let pipeline = Pipeline::passthrough();
        let reader = PackReader::parse(sample_packfile(&pipeline), &pipeline).unwrap();

        assert_eq!(reader.footer().count, 2);
        let entry = reader
            .find(ResourceType::Object, Mac::from_bytes([2; 32]))
            .copied()
            .unwrap();
        assert_eq!(reader.blob(&entry, &pipeline).unwrap(), b"second");

        let first = reader.entries()[0];
        assert_eq!(reader.blob(&first, &pipeline).unwrap(), b"first blob");
    }

    #[test]
    fn corrupted_index_fails_integrity() {
        let pipeline = Pipeline::passthrough();
        let mut bytes = sample_packfile(&pipeline);

        // flip one byte inside the index region
        let footer_len =
            u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap()) as usize;
        let index_byte = bytes.len() - 4 - footer_len - 1;
        bytes[index_byte] ^= 0x01;

        assert!(matches!(
            PackReader::parse(bytes, &pipeline),
            Err(Error::IntegrityFailure)
        ));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let pipeline = Pipeline::passthrough();
        let bytes = sample_packfile(&pipeline);
        assert!(PackReader::parse(bytes[..3].to_vec(), &pipeline).is_err());
        assert!(PackReader::parse(vec![0xFF; 8], &pipeline).is_err());
    }

    #[test]
    fn count_mismatch_is_detected() {
        let pipeline = Pipeline::passthrough();
        let mut bytes = sample_packfile(&pipeline);

        // rewrite the footer with a wrong count but a matching index MAC
        let footer_len =
            u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap()) as usize;
        let footer_start = bytes.len() - 4 - footer_len;
        let mut footer = PackFooter::decode(&bytes[footer_start..bytes.len() - 4]).unwrap();
        footer.count = 5;
        bytes[footer_start..footer_start + footer_len].copy_from_slice(&footer.encode());

        assert!(matches!(
            PackReader::parse(bytes, &pipeline),
            Err(Error::IndexMismatch)
        ));
    }

    #[test]
    fn encrypted_packfile_roundtrips() {
        let mut config = crate::config::RepositoryConfig::new();
        config.enable_compression(3);
        config.enable_encryption(crate::hashing::generate_salt().unwrap());
        let keys = crate::hashing::Keys::derive(&config, Some(b"s3cret")).unwrap();
        let pipeline = Pipeline::from_config(&config, &keys).unwrap();

        let reader = PackReader::parse(sample_packfile(&pipeline), &pipeline).unwrap();
        let entry = reader
            .find(ResourceType::Chunk, Mac::from_bytes([1; 32]))
            .copied()
            .unwrap();
        assert_eq!(reader.blob(&entry, &pipeline).unwrap(), b"first blob");
    }
}

//! The on-disk state stream: a sequence of typed records followed by a
//! metadata trailer, little-endian throughout. Records are
//! self-delimiting; each entry type implies a fixed or length-prefixed
//! body.
//!
//! ```text
//! 0x01 resource:u32 version:u32 mac:32 packfile:32 offset:u64 length:u32
//! 0x02 state_id:32 packfile:32
//! 0x03 resource:u32 mac:32 deleted_at:i64
//! 0x04 version:u32 timestamp:i64 serial:16 aggregate:u8 extends_count:u32 extends:32*
//! ```

use std::io::Write;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::resource::{Location, Mac, ResourceType, MAC_SIZE};
use crate::state::{DeltaEntry, Metadata};

pub const STATE_VERSION: u32 = 1;

const RECORD_DELTA: u8 = 0x01;
const RECORD_PACKFILE: u8 = 0x02;
const RECORD_TOMBSTONE: u8 = 0x03;
const RECORD_METADATA: u8 = 0x04;

pub(crate) fn write_delta<W: Write>(w: &mut W, entry: &DeltaEntry) -> Result<()> {
    w.write_all(&[RECORD_DELTA])?;
    w.write_all(&entry.resource.as_u32().to_le_bytes())?;
    w.write_all(&entry.version.to_le_bytes())?;
    w.write_all(entry.mac.as_bytes())?;
    w.write_all(entry.location.packfile.as_bytes())?;
    w.write_all(&entry.location.offset.to_le_bytes())?;
    w.write_all(&entry.location.length.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_packfile<W: Write>(w: &mut W, state_id: Mac, packfile: Mac) -> Result<()> {
    w.write_all(&[RECORD_PACKFILE])?;
    w.write_all(state_id.as_bytes())?;
    w.write_all(packfile.as_bytes())?;
    Ok(())
}

pub(crate) fn write_tombstone<W: Write>(
    w: &mut W,
    resource: ResourceType,
    mac: Mac,
    deleted_at: i64,
) -> Result<()> {
    w.write_all(&[RECORD_TOMBSTONE])?;
    w.write_all(&resource.as_u32().to_le_bytes())?;
    w.write_all(mac.as_bytes())?;
    w.write_all(&deleted_at.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_metadata<W: Write>(w: &mut W, metadata: &Metadata) -> Result<()> {
    w.write_all(&[RECORD_METADATA])?;
    w.write_all(&metadata.version.to_le_bytes())?;
    w.write_all(&metadata.timestamp.to_le_bytes())?;
    w.write_all(metadata.serial.as_bytes())?;
    w.write_all(&[u8::from(metadata.aggregate)])?;
    w.write_all(&(metadata.extends.len() as u32).to_le_bytes())?;
    for mac in &metadata.extends {
        w.write_all(mac.as_bytes())?;
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Record {
    Delta(DeltaEntry),
    Packfile { state_id: Mac, packfile: Mac },
    Tombstone {
        resource: ResourceType,
        mac: Mac,
        deleted_at: i64,
    },
    Metadata(Metadata),
}

pub(crate) struct RecordParser<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::MalformedState);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("u32 slice")))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("u64 slice")))
    }

    fn take_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("i64 slice")))
    }

    fn take_mac(&mut self) -> Result<Mac> {
        Mac::from_slice(self.take(MAC_SIZE)?).map_err(|_| Error::MalformedState)
    }

    fn take_resource(&mut self) -> Result<ResourceType> {
        ResourceType::from_u32(self.take_u32()?).map_err(|_| Error::MalformedState)
    }

    /// Next record, or `None` at a clean end of stream. The metadata
    /// trailer is the final record; trailing bytes after it are rejected.
    pub fn next(&mut self) -> Result<Option<Record>> {
        let Some((&tag, rest)) = self.bytes.split_first() else {
            return Ok(None);
        };
        self.bytes = rest;

        let record = match tag {
            RECORD_DELTA => Record::Delta(DeltaEntry {
                resource: self.take_resource()?,
                version: self.take_u32()?,
                mac: self.take_mac()?,
                location: Location {
                    packfile: self.take_mac()?,
                    offset: self.take_u64()?,
                    length: self.take_u32()?,
                },
            }),
            RECORD_PACKFILE => Record::Packfile {
                state_id: self.take_mac()?,
                packfile: self.take_mac()?,
            },
            RECORD_TOMBSTONE => Record::Tombstone {
                resource: self.take_resource()?,
                mac: self.take_mac()?,
                deleted_at: self.take_i64()?,
            },
            RECORD_METADATA => {
                let version = self.take_u32()?;
                let timestamp = self.take_i64()?;
                let serial = Uuid::from_bytes(
                    self.take(16)?.try_into().expect("uuid slice"),
                );
                let aggregate = self.take(1)?[0] != 0;
                let count = self.take_u32()? as usize;
                let mut extends = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    extends.push(self.take_mac()?);
                }
                if !self.bytes.is_empty() {
                    return Err(Error::MalformedState);
                }
                Record::Metadata(Metadata {
                    version,
                    timestamp,
                    serial,
                    aggregate,
                    extends,
                })
            }
            _ => return Err(Error::MalformedState),
        };

        Ok(Some(record))
    }
}

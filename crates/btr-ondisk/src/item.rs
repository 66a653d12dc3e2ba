//! Disk key codec plus the fixed-layout items rescue flows read and write.

use btr_types::{
    DEV_ITEM_SIZE, Key, ParseError, read_fixed, read_le_u32, read_le_u64, read_u8, write_bytes,
    write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

/// Decode a 17-byte disk key at `offset`.
pub fn read_key_at(data: &[u8], offset: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, offset)?,
        item_type: read_u8(data, offset + 8)?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

/// Encode `key` as 17 bytes at `offset`.
pub fn write_key_at(data: &mut [u8], offset: usize, key: Key) -> Result<(), ParseError> {
    write_le_u64(data, offset, key.objectid)?;
    write_u8(data, offset + 8, key.item_type)?;
    write_le_u64(data, offset + 9, key.offset)?;
    Ok(())
}

/// Device item: embedded in the superblock at 0xC9 and stored in the chunk
/// tree under (DEV_ITEMS, DEV_ITEM, devid).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

impl DevItem {
    /// Parse a 98-byte device item at `offset`.
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            devid: read_le_u64(data, offset)?,
            total_bytes: read_le_u64(data, offset + 8)?,
            bytes_used: read_le_u64(data, offset + 16)?,
            io_align: read_le_u32(data, offset + 24)?,
            io_width: read_le_u32(data, offset + 28)?,
            sector_size: read_le_u32(data, offset + 32)?,
            dev_type: read_le_u64(data, offset + 36)?,
            generation: read_le_u64(data, offset + 44)?,
            start_offset: read_le_u64(data, offset + 52)?,
            dev_group: read_le_u32(data, offset + 60)?,
            seek_speed: read_u8(data, offset + 64)?,
            bandwidth: read_u8(data, offset + 65)?,
            uuid: read_fixed::<16>(data, offset + 66)?,
            fsid: read_fixed::<16>(data, offset + 82)?,
        })
    }

    /// Encode as 98 bytes at `offset`.
    pub fn write_at(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.devid)?;
        write_le_u64(data, offset + 8, self.total_bytes)?;
        write_le_u64(data, offset + 16, self.bytes_used)?;
        write_le_u32(data, offset + 24, self.io_align)?;
        write_le_u32(data, offset + 28, self.io_width)?;
        write_le_u32(data, offset + 32, self.sector_size)?;
        write_le_u64(data, offset + 36, self.dev_type)?;
        write_le_u64(data, offset + 44, self.generation)?;
        write_le_u64(data, offset + 52, self.start_offset)?;
        write_le_u32(data, offset + 60, self.dev_group)?;
        write_u8(data, offset + 64, self.seek_speed)?;
        write_u8(data, offset + 65, self.bandwidth)?;
        write_bytes(data, offset + 66, &self.uuid)?;
        write_bytes(data, offset + 82, &self.fsid)?;
        Ok(())
    }

    /// Fixed encoded size in bytes.
    #[must_use]
    pub const fn encoded_size() -> usize {
        DEV_ITEM_SIZE
    }
}

/// The subset of a root item (439 bytes on disk) that tree bootstrap and
/// rescue flows read: the embedded inode is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
}

/// Minimum root item payload length: fields through `level` at byte 238.
pub const ROOT_ITEM_MIN_SIZE: usize = 239;

impl RootItem {
    /// Parse a root item payload. The embedded inode occupies bytes 0..160.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < ROOT_ITEM_MIN_SIZE {
            return Err(ParseError::InsufficientData {
                needed: ROOT_ITEM_MIN_SIZE,
                offset: 0,
                actual: payload.len(),
            });
        }
        Ok(Self {
            generation: read_le_u64(payload, 160)?,
            root_dirid: read_le_u64(payload, 168)?,
            bytenr: read_le_u64(payload, 176)?,
            byte_limit: read_le_u64(payload, 184)?,
            bytes_used: read_le_u64(payload, 192)?,
            last_snapshot: read_le_u64(payload, 200)?,
            flags: read_le_u64(payload, 208)?,
            refs: read_le_u32(payload, 216)?,
            drop_progress: read_key_at(payload, 220)?,
            drop_level: read_u8(payload, 237)?,
            level: read_u8(payload, 238)?,
        })
    }

    /// Encode into an existing payload buffer, leaving the embedded inode
    /// and any trailing bytes untouched.
    pub fn write_to(&self, payload: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(payload, 160, self.generation)?;
        write_le_u64(payload, 168, self.root_dirid)?;
        write_le_u64(payload, 176, self.bytenr)?;
        write_le_u64(payload, 184, self.byte_limit)?;
        write_le_u64(payload, 192, self.bytes_used)?;
        write_le_u64(payload, 200, self.last_snapshot)?;
        write_le_u64(payload, 208, self.flags)?;
        write_le_u32(payload, 216, self.refs)?;
        write_key_at(payload, 220, self.drop_progress)?;
        write_u8(payload, 237, self.drop_level)?;
        write_u8(payload, 238, self.level)?;
        Ok(())
    }
}

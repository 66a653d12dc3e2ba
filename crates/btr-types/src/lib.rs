#![forbid(unsafe_code)]
//! Wire-format constants and byte-level parsing primitives.
//!
//! Everything here is pure: fixed offsets, the B-tree [`Key`] and its total
//! order, and bounds-checked little-endian read/write helpers shared by the
//! codec and tree crates. No I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Primary superblock offset (64 KiB).
pub const SUPER_INFO_OFFSET: u64 = 64 * 1024;
/// Superblock mirror copies at fixed device offsets: 64 KiB, 64 MiB, 256 GiB.
pub const SUPER_COPY_OFFSETS: [u64; 3] = [SUPER_INFO_OFFSET, 64 * 1024 * 1024, 256 * 1024 * 1024 * 1024];
/// On-disk superblock size in bytes.
pub const SUPER_INFO_SIZE: usize = 4096;
/// `_BHRfS_M` as a little-endian u64.
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Tree block header size (csum + fsid + bytenr + flags + chunk uuid +
/// generation + owner + nritems + level).
pub const HEADER_SIZE: usize = 101;
/// Size of one leaf item directory entry (key 17 + offset u32 + size u32).
pub const LEAF_ITEM_SIZE: usize = 25;
/// Size of one internal-node key pointer (key 17 + blockptr u64 + generation u64).
pub const KEY_PTR_SIZE: usize = 33;
/// Size of a disk key on the wire.
pub const DISK_KEY_SIZE: usize = 17;
/// Kernel-enforced maximum tree depth (levels 0-7).
pub const MAX_LEVEL: u8 = 7;
/// Width of the header checksum field; only the first bytes of the
/// configured algorithm are used, the rest stay zero.
pub const CSUM_FIELD_SIZE: usize = 32;

/// Fixed head of a chunk item before the stripe array.
pub const CHUNK_ITEM_FIXED_SIZE: usize = 48;
/// Size of one stripe record inside a chunk item.
pub const STRIPE_SIZE: usize = 32;
/// Size of a device item.
pub const DEV_ITEM_SIZE: usize = 98;
/// Maximum size of the superblock's embedded system chunk array.
pub const SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Number of backup root slots in the superblock.
pub const NUM_BACKUP_ROOTS: usize = 4;

// ── Well-known tree object ids ──────────────────────────────────────────────

pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const CSUM_TREE_OBJECTID: u64 = 7;
pub const UUID_TREE_OBJECTID: u64 = 9;
pub const FREE_SPACE_TREE_OBJECTID: u64 = 10;
/// Objectid of device items inside the chunk tree.
pub const DEV_ITEMS_OBJECTID: u64 = 1;
/// Objectid of the first chunk tree (all chunk items carry it).
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
/// Objectid shared by all extent checksum items (-10 as u64).
pub const EXTENT_CSUM_OBJECTID: u64 = 0xFFFF_FFFF_FFFF_FFF6;

// ── Key types ───────────────────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const DIR_ITEM_KEY: u8 = 84;
pub const DIR_INDEX_KEY: u8 = 96;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const EXTENT_CSUM_KEY: u8 = 128;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;

// ── Checksum algorithms (superblock `csum_type`) ────────────────────────────

pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

/// Bytes of checksum stored per sector for a given algorithm, or `None`
/// for unknown types.
#[must_use]
pub fn csum_type_size(csum_type: u16) -> Option<usize> {
    match csum_type {
        CSUM_TYPE_CRC32C => Some(4),
        CSUM_TYPE_XXHASH64 => Some(8),
        CSUM_TYPE_SHA256 | CSUM_TYPE_BLAKE2B => Some(32),
        _ => None,
    }
}

/// Chunk type flag: chunk holds file data.
pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
/// Chunk type flag: chunk holds system (chunk tree) metadata.
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
/// Chunk type flag: chunk holds tree metadata.
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;

/// compat_ro flag: the v2 free space tree is in use.
pub const COMPAT_RO_FREE_SPACE_TREE: u64 = 1 << 0;
/// compat_ro flag: the v2 free space tree is fully populated.
pub const COMPAT_RO_FREE_SPACE_TREE_VALID: u64 = 1 << 1;

/// B-tree key: ordered triple (objectid, type, offset).
///
/// The derived `Ord` is the on-disk total order: objectid first, then the
/// type byte, then offset, all unsigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Key of the checksum item covering byte `bytenr`.
    #[must_use]
    pub const fn csum(bytenr: u64) -> Self {
        Self::new(EXTENT_CSUM_OBJECTID, EXTENT_CSUM_KEY, bytenr)
    }

    #[must_use]
    pub fn is_csum(&self) -> bool {
        self.objectid == EXTENT_CSUM_OBJECTID && self.item_type == EXTENT_CSUM_KEY
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

/// Monotonic transaction counter stamped into tree blocks and superblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, src: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, src.len())?.copy_from_slice(src);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn read_helpers_out_of_bounds() {
        let bytes = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&bytes, 0),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
        assert!(read_le_u16(&bytes, 3).is_err());
        assert!(read_le_u16(&bytes, usize::MAX).is_err());
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u64(&mut buf, 0, 0xDEAD_BEEF_CAFE_BABE).expect("write");
        write_le_u32(&mut buf, 8, 0x1234_5678).expect("write");
        write_le_u16(&mut buf, 12, 0xABCD).expect("write");
        write_u8(&mut buf, 14, 0x42).expect("write");
        assert_eq!(read_le_u64(&buf, 0).expect("read"), 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(read_le_u32(&buf, 8).expect("read"), 0x1234_5678);
        assert_eq!(read_le_u16(&buf, 12).expect("read"), 0xABCD);
        assert_eq!(read_u8(&buf, 14).expect("read"), 0x42);

        assert!(write_le_u32(&mut buf, 14, 0).is_err());
    }

    #[test]
    fn key_total_order() {
        let a = Key::new(1, 10, 100);
        let b = Key::new(1, 10, 200);
        let c = Key::new(1, 11, 0);
        let d = Key::new(2, 0, 0);
        assert!(a < b && b < c && c < d);

        // Unsigned comparison on all three fields.
        let high = Key::new(EXTENT_CSUM_OBJECTID, EXTENT_CSUM_KEY, 0);
        assert!(d < high);
    }

    #[test]
    fn csum_key_helper() {
        let key = Key::csum(0x1000);
        assert!(key.is_csum());
        assert_eq!(key.offset, 0x1000);
        assert!(!Key::new(5, INODE_ITEM_KEY, 0).is_csum());
    }

    #[test]
    fn csum_type_sizes() {
        assert_eq!(csum_type_size(CSUM_TYPE_CRC32C), Some(4));
        assert_eq!(csum_type_size(CSUM_TYPE_XXHASH64), Some(8));
        assert_eq!(csum_type_size(CSUM_TYPE_SHA256), Some(32));
        assert_eq!(csum_type_size(CSUM_TYPE_BLAKE2B), Some(32));
        assert_eq!(csum_type_size(99), None);
    }

    #[test]
    fn align_down_cases() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_down(4096, 4096), Some(4096));
        assert_eq!(align_down(0, 4096), Some(0));
        assert_eq!(align_down(100, 0), None);
        assert_eq!(align_down(100, 3), None);
    }

    #[test]
    fn trim_nul_padded_label() {
        assert_eq!(trim_nul_padded(b"rescue\0\0\0"), "rescue");
        assert_eq!(trim_nul_padded(b""), "");
    }

    #[test]
    fn super_copy_offsets_are_ordered() {
        assert!(SUPER_COPY_OFFSETS.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(SUPER_COPY_OFFSETS[0], SUPER_INFO_OFFSET);
    }
}

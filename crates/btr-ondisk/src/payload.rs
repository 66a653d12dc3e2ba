//! Typed view over leaf item payloads, keyed by the item type byte.
//!
//! Dump and inspection tooling decodes each leaf item into one of these
//! variants; unparsed or unrecognized kinds fall back to [`ItemPayload::Unknown`]
//! so a damaged item never stops a dump.

use crate::chunk::{ChunkEntry, parse_chunk_payload};
use crate::item::{DevItem, RootItem, read_key_at};
use btr_types::{
    CHUNK_ITEM_KEY, DEV_ITEM_KEY, DIR_INDEX_KEY, DIR_ITEM_KEY, EXTENT_CSUM_KEY, EXTENT_DATA_KEY,
    EXTENT_ITEM_KEY, INODE_ITEM_KEY, INODE_REF_KEY, Key, ParseError, ROOT_ITEM_KEY, read_le_u16,
    read_le_u32, read_le_u64, read_u8, trim_nul_padded,
};
use serde::Serialize;

/// Fields of an inode item consumed by inspection output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u64,
}

impl InodeItem {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            generation: read_le_u64(payload, 0)?,
            transid: read_le_u64(payload, 8)?,
            size: read_le_u64(payload, 16)?,
            nbytes: read_le_u64(payload, 24)?,
            nlink: read_le_u32(payload, 40)?,
            uid: read_le_u32(payload, 44)?,
            gid: read_le_u32(payload, 48)?,
            mode: read_le_u32(payload, 52)?,
            flags: read_le_u64(payload, 64)?,
        })
    }
}

/// Back reference from an inode to one of its names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: String,
}

impl InodeRef {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let index = read_le_u64(payload, 0)?;
        let name_len = usize::from(read_le_u16(payload, 8)?);
        let name = btr_types::ensure_slice(payload, 10, name_len)?;
        Ok(Self {
            index,
            name: trim_nul_padded(name),
        })
    }
}

/// One directory entry (DIR_ITEM or DIR_INDEX share the layout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub location: Key,
    pub transid: u64,
    pub file_type: u8,
    pub name: String,
}

impl DirEntry {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let location = read_key_at(payload, 0)?;
        let transid = read_le_u64(payload, 17)?;
        let name_len = usize::from(read_le_u16(payload, 27)?);
        let file_type = read_u8(payload, 29)?;
        let name = btr_types::ensure_slice(payload, 30, name_len)?;
        Ok(Self {
            location,
            transid,
            file_type,
            name: trim_nul_padded(name),
        })
    }
}

/// A file extent mapping. Inline extents carry their length only; regular
/// and prealloc extents name the backing disk range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ExtentData {
    Inline {
        generation: u64,
        ram_bytes: u64,
        compression: u8,
        data_len: usize,
    },
    Regular {
        generation: u64,
        ram_bytes: u64,
        compression: u8,
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
        prealloc: bool,
    },
}

const EXTENT_DATA_INLINE: u8 = 0;
const EXTENT_DATA_REG: u8 = 1;
const EXTENT_DATA_PREALLOC: u8 = 2;

impl ExtentData {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let generation = read_le_u64(payload, 0)?;
        let ram_bytes = read_le_u64(payload, 8)?;
        let compression = read_u8(payload, 16)?;
        let extent_type = read_u8(payload, 20)?;
        match extent_type {
            EXTENT_DATA_INLINE => Ok(Self::Inline {
                generation,
                ram_bytes,
                compression,
                data_len: payload.len().saturating_sub(21),
            }),
            EXTENT_DATA_REG | EXTENT_DATA_PREALLOC => Ok(Self::Regular {
                generation,
                ram_bytes,
                compression,
                disk_bytenr: read_le_u64(payload, 21)?,
                disk_num_bytes: read_le_u64(payload, 29)?,
                offset: read_le_u64(payload, 37)?,
                num_bytes: read_le_u64(payload, 45)?,
                prealloc: extent_type == EXTENT_DATA_PREALLOC,
            }),
            _ => Err(ParseError::InvalidField {
                field: "extent_data.type",
                reason: "unknown extent type",
            }),
        }
    }
}

/// Reference header of an extent tree item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
}

impl ExtentItem {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            refs: read_le_u64(payload, 0)?,
            generation: read_le_u64(payload, 8)?,
            flags: read_le_u64(payload, 16)?,
        })
    }
}

/// Decoded leaf item payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    InodeItem(InodeItem),
    InodeRef(InodeRef),
    DirItem(DirEntry),
    DirIndex(DirEntry),
    ExtentData(ExtentData),
    /// Checksum run: number of per-sector entries in the item.
    ExtentCsum { entries: usize },
    RootItem(RootItem),
    ExtentItem(ExtentItem),
    DevItem(DevItem),
    ChunkItem(ChunkEntry),
    Unknown { item_type: u8, len: usize },
}

/// Decode a leaf item payload according to its key's type byte.
///
/// `csum_size` sizes the entries of a checksum item. Types this module does
/// not know decode to [`ItemPayload::Unknown`]; a known type with a
/// malformed payload is a parse error.
pub fn decode_payload(key: Key, payload: &[u8], csum_size: usize) -> Result<ItemPayload, ParseError> {
    Ok(match key.item_type {
        INODE_ITEM_KEY => ItemPayload::InodeItem(InodeItem::parse(payload)?),
        INODE_REF_KEY => ItemPayload::InodeRef(InodeRef::parse(payload)?),
        DIR_ITEM_KEY => ItemPayload::DirItem(DirEntry::parse(payload)?),
        DIR_INDEX_KEY => ItemPayload::DirIndex(DirEntry::parse(payload)?),
        EXTENT_DATA_KEY => ItemPayload::ExtentData(ExtentData::parse(payload)?),
        EXTENT_CSUM_KEY => {
            if csum_size == 0 || payload.len() % csum_size != 0 {
                return Err(ParseError::InvalidField {
                    field: "extent_csum.len",
                    reason: "payload not a whole number of checksum entries",
                });
            }
            ItemPayload::ExtentCsum {
                entries: payload.len() / csum_size,
            }
        }
        ROOT_ITEM_KEY => ItemPayload::RootItem(RootItem::parse(payload)?),
        EXTENT_ITEM_KEY => ItemPayload::ExtentItem(ExtentItem::parse(payload)?),
        DEV_ITEM_KEY => ItemPayload::DevItem(DevItem::parse_at(payload, 0)?),
        CHUNK_ITEM_KEY => {
            let (entry, _) = parse_chunk_payload(payload, 0, key.offset)?;
            ItemPayload::ChunkItem(entry)
        }
        other => ItemPayload::Unknown {
            item_type: other,
            len: payload.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use btr_types::{write_le_u16, write_le_u32, write_le_u64, write_u8};

    #[test]
    fn decode_inode_item() {
        let mut payload = vec![0_u8; 160];
        write_le_u64(&mut payload, 0, 9).expect("generation");
        write_le_u64(&mut payload, 16, 4096).expect("size");
        write_le_u32(&mut payload, 40, 2).expect("nlink");
        write_le_u32(&mut payload, 52, 0o100644).expect("mode");

        let key = Key::new(257, INODE_ITEM_KEY, 0);
        let decoded = decode_payload(key, &payload, 4).expect("decode");
        let ItemPayload::InodeItem(inode) = decoded else {
            panic!("expected inode item, got {decoded:?}");
        };
        assert_eq!(inode.generation, 9);
        assert_eq!(inode.size, 4096);
        assert_eq!(inode.nlink, 2);
        assert_eq!(inode.mode, 0o100644);
    }

    #[test]
    fn decode_dir_entry_with_name() {
        let name = b"hello.txt";
        let mut payload = vec![0_u8; 30 + name.len()];
        write_le_u64(&mut payload, 0, 258).expect("location objectid");
        write_u8(&mut payload, 8, INODE_ITEM_KEY).expect("location type");
        write_le_u64(&mut payload, 17, 77).expect("transid");
        write_le_u16(&mut payload, 27, name.len() as u16).expect("name_len");
        write_u8(&mut payload, 29, 1).expect("file_type");
        payload[30..].copy_from_slice(name);

        let key = Key::new(256, DIR_ITEM_KEY, 0x1234);
        let decoded = decode_payload(key, &payload, 4).expect("decode");
        let ItemPayload::DirItem(entry) = decoded else {
            panic!("expected dir item, got {decoded:?}");
        };
        assert_eq!(entry.location, Key::new(258, INODE_ITEM_KEY, 0));
        assert_eq!(entry.transid, 77);
        assert_eq!(entry.name, "hello.txt");
    }

    #[test]
    fn decode_regular_extent_data() {
        let mut payload = vec![0_u8; 53];
        write_le_u64(&mut payload, 0, 5).expect("generation");
        write_le_u64(&mut payload, 8, 8192).expect("ram_bytes");
        write_u8(&mut payload, 20, 1).expect("type");
        write_le_u64(&mut payload, 21, 0x40_0000).expect("disk_bytenr");
        write_le_u64(&mut payload, 29, 8192).expect("disk_num_bytes");
        write_le_u64(&mut payload, 45, 8192).expect("num_bytes");

        let key = Key::new(257, EXTENT_DATA_KEY, 0);
        let decoded = decode_payload(key, &payload, 4).expect("decode");
        let ItemPayload::ExtentData(ExtentData::Regular {
            disk_bytenr,
            num_bytes,
            prealloc,
            ..
        }) = decoded
        else {
            panic!("expected regular extent, got {decoded:?}");
        };
        assert_eq!(disk_bytenr, 0x40_0000);
        assert_eq!(num_bytes, 8192);
        assert!(!prealloc);
    }

    #[test]
    fn decode_csum_run_counts_entries() {
        let key = Key::csum(0x10_0000);
        let decoded = decode_payload(key, &[0_u8; 24], 4).expect("decode");
        assert_eq!(decoded, ItemPayload::ExtentCsum { entries: 6 });

        let err = decode_payload(key, &[0_u8; 23], 4).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { .. }));
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let key = Key::new(1, 250, 0);
        let decoded = decode_payload(key, &[1, 2, 3], 4).expect("decode");
        assert_eq!(
            decoded,
            ItemPayload::Unknown {
                item_type: 250,
                len: 3
            }
        );
    }

    #[test]
    fn truncated_known_payload_is_an_error() {
        let key = Key::new(257, INODE_ITEM_KEY, 0);
        let err = decode_payload(key, &[0_u8; 10], 4).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }
}

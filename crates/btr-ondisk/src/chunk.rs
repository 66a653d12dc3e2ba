//! Chunk item codec and the logical-to-physical address map.
//!
//! Chunk items appear twice on disk with the same encoding: embedded in the
//! superblock's sys_chunk_array (disk key + chunk payload back to back) and
//! as leaf payloads in the chunk tree (key in the item directory, payload
//! alone). Both forms share [`parse_chunk_payload`] / [`encode_chunk_payload`].

use crate::item::{read_key_at, write_key_at};
use btr_types::{
    CHUNK_ITEM_FIXED_SIZE, CHUNK_ITEM_KEY, DISK_KEY_SIZE, FIRST_CHUNK_TREE_OBJECTID, Key,
    ParseError, STRIPE_SIZE, read_fixed, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// A single stripe within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A chunk item paired with its key. `key.offset` is the logical start of
/// the mapped range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: Key,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkEntry {
    /// Logical byte range covered: `[start, end)`.
    pub fn logical_range(&self) -> Result<(u64, u64), ParseError> {
        let start = self.key.offset;
        let end = start.checked_add(self.length).ok_or(ParseError::InvalidField {
            field: "chunk_length",
            reason: "logical range overflow",
        })?;
        Ok((start, end))
    }

    /// Encoded payload size: fixed head plus one record per stripe.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        CHUNK_ITEM_FIXED_SIZE + self.stripes.len() * STRIPE_SIZE
    }
}

/// Parse a chunk payload (no leading key) starting at `offset`.
///
/// `logical` becomes the entry's key offset; chunk tree leaves pass the key
/// offset from the item directory, the sys array passes the decoded key.
pub fn parse_chunk_payload(
    data: &[u8],
    offset: usize,
    logical: u64,
) -> Result<(ChunkEntry, usize), ParseError> {
    let length = read_le_u64(data, offset)?;
    let owner = read_le_u64(data, offset + 8)?;
    let stripe_len = read_le_u64(data, offset + 16)?;
    let chunk_type = read_le_u64(data, offset + 24)?;
    let io_align = read_le_u32(data, offset + 32)?;
    let io_width = read_le_u32(data, offset + 36)?;
    let sector_size = read_le_u32(data, offset + 40)?;
    let num_stripes = read_le_u16(data, offset + 44)?;
    let sub_stripes = read_le_u16(data, offset + 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let mut cur = offset + CHUNK_ITEM_FIXED_SIZE;
    let mut stripes = Vec::with_capacity(stripes_count);
    for _ in 0..stripes_count {
        stripes.push(Stripe {
            devid: read_le_u64(data, cur)?,
            offset: read_le_u64(data, cur + 8)?,
            dev_uuid: read_fixed::<16>(data, cur + 16)?,
        });
        cur += STRIPE_SIZE;
    }

    let entry = ChunkEntry {
        key: Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, logical),
        length,
        owner,
        stripe_len,
        chunk_type,
        io_align,
        io_width,
        sector_size,
        sub_stripes,
        stripes,
    };
    Ok((entry, cur - offset))
}

/// Encode a chunk payload (no leading key).
pub fn encode_chunk_payload(entry: &ChunkEntry) -> Result<Vec<u8>, ParseError> {
    let num_stripes = u16::try_from(entry.stripes.len())
        .map_err(|_| ParseError::IntegerConversion { field: "num_stripes" })?;
    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let mut out = Vec::with_capacity(entry.payload_size());
    out.extend_from_slice(&entry.length.to_le_bytes());
    out.extend_from_slice(&entry.owner.to_le_bytes());
    out.extend_from_slice(&entry.stripe_len.to_le_bytes());
    out.extend_from_slice(&entry.chunk_type.to_le_bytes());
    out.extend_from_slice(&entry.io_align.to_le_bytes());
    out.extend_from_slice(&entry.io_width.to_le_bytes());
    out.extend_from_slice(&entry.sector_size.to_le_bytes());
    out.extend_from_slice(&num_stripes.to_le_bytes());
    out.extend_from_slice(&entry.sub_stripes.to_le_bytes());
    for stripe in &entry.stripes {
        out.extend_from_slice(&stripe.devid.to_le_bytes());
        out.extend_from_slice(&stripe.offset.to_le_bytes());
        out.extend_from_slice(&stripe.dev_uuid);
    }
    Ok(out)
}

/// Parse all entries from a sys_chunk_array byte slice: alternating disk
/// key + chunk payload pairs.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<ChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = read_key_at(data, cur)?;
        if key.item_type != CHUNK_ITEM_KEY {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "entry key is not a chunk item",
            });
        }
        cur += DISK_KEY_SIZE;

        if cur + CHUNK_ITEM_FIXED_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: CHUNK_ITEM_FIXED_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let (entry, consumed) = parse_chunk_payload(data, cur, key.offset)?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

/// Encode entries as a sys_chunk_array byte string.
pub fn encode_sys_chunk_array(entries: &[ChunkEntry]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    for entry in entries {
        let mut key_buf = [0_u8; DISK_KEY_SIZE];
        write_key_at(&mut key_buf, 0, entry.key)?;
        out.extend_from_slice(&key_buf);
        out.extend_from_slice(&encode_chunk_payload(entry)?);
    }
    Ok(out)
}

/// Result of a logical-to-physical bytenr mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Logical-to-physical address map assembled from chunk entries.
///
/// Entries are kept sorted by logical start; lookups use the first stripe
/// (single-device assumption, RAID profiles are out of scope).
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    entries: Vec<ChunkEntry>,
}

impl ChunkMap {
    pub fn new(mut entries: Vec<ChunkEntry>) -> Self {
        entries.sort_by_key(|e| e.key.offset);
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    pub fn insert(&mut self, entry: ChunkEntry) {
        let pos = self
            .entries
            .partition_point(|e| e.key.offset <= entry.key.offset);
        self.entries.insert(pos, entry);
    }

    /// Map a logical byte address to a (devid, physical offset) pair.
    ///
    /// Returns `Ok(None)` when no chunk covers the address.
    pub fn map(&self, logical: u64) -> Result<Option<PhysicalMapping>, ParseError> {
        self.map_stripe(logical, 0)
    }

    /// Find the chunk entry whose logical range covers `logical`.
    pub fn covering(&self, logical: u64) -> Result<Option<&ChunkEntry>, ParseError> {
        let idx = self.entries.partition_point(|e| e.key.offset <= logical);
        let Some(entry) = idx.checked_sub(1).and_then(|i| self.entries.get(i)) else {
            return Ok(None);
        };
        let (start, end) = entry.logical_range()?;
        if logical < start || logical >= end {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Number of stripe copies holding the data at `logical`, or `None`
    /// when no chunk covers the address.
    pub fn stripe_count(&self, logical: u64) -> Result<Option<usize>, ParseError> {
        Ok(self.covering(logical)?.map(|entry| entry.stripes.len()))
    }

    /// Map through a specific stripe copy, 0-based. A covered address with
    /// a stripe index past the chunk's stripe count is an error, distinct
    /// from the uncovered `Ok(None)` case.
    pub fn map_stripe(
        &self,
        logical: u64,
        stripe_index: usize,
    ) -> Result<Option<PhysicalMapping>, ParseError> {
        let Some(entry) = self.covering(logical)? else {
            return Ok(None);
        };
        let start = entry.key.offset;
        let stripe = entry.stripes.get(stripe_index).ok_or(ParseError::InvalidField {
            field: "stripe_index",
            reason: "no such stripe copy in the covering chunk",
        })?;
        let physical = stripe
            .offset
            .checked_add(logical - start)
            .ok_or(ParseError::InvalidField {
                field: "stripe_offset",
                reason: "physical address overflow",
            })?;
        Ok(Some(PhysicalMapping {
            devid: stripe.devid,
            physical,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btr_types::BLOCK_GROUP_SYSTEM;

    fn sample_entry(logical: u64, length: u64, physical: u64) -> ChunkEntry {
        ChunkEntry {
            key: Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, logical),
            length,
            owner: 2,
            stripe_len: 64 * 1024,
            chunk_type: BLOCK_GROUP_SYSTEM,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            sub_stripes: 0,
            stripes: vec![Stripe {
                devid: 1,
                offset: physical,
                dev_uuid: [0; 16],
            }],
        }
    }

    #[test]
    fn chunk_payload_round_trip() {
        let entry = sample_entry(0x100_0000, 0x80_0000, 0x20_0000);
        let bytes = encode_chunk_payload(&entry).expect("encode");
        assert_eq!(bytes.len(), CHUNK_ITEM_FIXED_SIZE + STRIPE_SIZE);

        let (parsed, consumed) = parse_chunk_payload(&bytes, 0, 0x100_0000).expect("parse");
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, entry);
    }

    #[test]
    fn sys_chunk_array_round_trip() {
        let entries = vec![
            sample_entry(0x100_0000, 0x80_0000, 0x20_0000),
            sample_entry(0x400_0000, 0x40_0000, 0xA0_0000),
        ];
        let bytes = encode_sys_chunk_array(&entries).expect("encode");
        let parsed = parse_sys_chunk_array(&bytes).expect("parse");
        assert_eq!(parsed, entries);
    }

    #[test]
    fn sys_chunk_array_truncated_key() {
        let data = [0_u8; 10];
        assert!(matches!(
            parse_sys_chunk_array(&data),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn sys_chunk_array_rejects_wrong_key_type() {
        let entry = sample_entry(0, 0x1000, 0);
        let mut bytes = encode_sys_chunk_array(&[entry]).expect("encode");
        bytes[8] = 1; // key type byte
        assert!(matches!(
            parse_sys_chunk_array(&bytes),
            Err(ParseError::InvalidField { field: "sys_chunk_array", .. })
        ));
    }

    #[test]
    fn chunk_rejects_zero_stripes() {
        let mut entry = sample_entry(0, 0x1000, 0);
        entry.stripes.clear();
        assert!(encode_chunk_payload(&entry).is_err());

        let good = sample_entry(0, 0x1000, 0);
        let mut bytes = encode_chunk_payload(&good).expect("encode");
        bytes[44..46].copy_from_slice(&0_u16.to_le_bytes());
        assert!(matches!(
            parse_chunk_payload(&bytes, 0, 0),
            Err(ParseError::InvalidField { field: "num_stripes", .. })
        ));
    }

    #[test]
    fn chunk_map_lookup() {
        let map = ChunkMap::new(vec![
            sample_entry(0x400_0000, 0x40_0000, 0xA0_0000),
            sample_entry(0x100_0000, 0x80_0000, 0x20_0000),
        ]);

        // Inside the first chunk: logical 16.5 MiB lands at physical 2.5 MiB.
        let hit = map.map(0x108_0000).expect("map").expect("covered");
        assert_eq!(hit.devid, 1);
        assert_eq!(hit.physical, 0x28_0000);

        // Exactly at a chunk start and one byte before its end.
        assert!(map.map(0x400_0000).expect("map").is_some());
        assert!(map.map(0x43F_FFFF).expect("map").is_some());

        // Gaps and the exclusive end are misses.
        assert!(map.map(0x440_0000).expect("map").is_none());
        assert!(map.map(0x200_0000).expect("map").is_none());
        assert!(map.map(0).expect("map").is_none());
    }

    #[test]
    fn chunk_map_stripe_count() {
        let mut mirrored = sample_entry(0x100_0000, 0x80_0000, 0x20_0000);
        mirrored.stripes.push(Stripe {
            devid: 1,
            offset: 0xC0_0000,
            dev_uuid: [0; 16],
        });
        let map = ChunkMap::new(vec![mirrored, sample_entry(0x400_0000, 0x40_0000, 0xA0_0000)]);

        assert_eq!(map.stripe_count(0x108_0000).expect("count"), Some(2));
        assert_eq!(map.stripe_count(0x400_0000).expect("count"), Some(1));
        assert_eq!(map.stripe_count(0x200_0000).expect("count"), None);

        // The second copy maps through its own physical base.
        let hit = map.map_stripe(0x108_0000, 1).expect("map").expect("covered");
        assert_eq!(hit.physical, 0xC8_0000);
    }

    #[test]
    fn chunk_map_empty() {
        let map = ChunkMap::default();
        assert!(map.map(0x1000).expect("map").is_none());
    }
}

//! Tree block header codec and block-level checksums.

use btr_types::{
    HEADER_SIZE, KEY_PTR_SIZE, LEAF_ITEM_SIZE, MAX_LEVEL, ParseError, read_fixed, read_le_u32,
    read_le_u64, read_u8, write_bytes, write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

/// Parsed tree block header (101 bytes at the start of every tree block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl Header {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: read_u8(block, 0x64)?,
        })
    }

    /// Encode all header fields into the first 101 bytes of `block`.
    pub fn write_to_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(block, 0x00, &self.csum)?;
        write_bytes(block, 0x20, &self.fsid)?;
        write_le_u64(block, 0x30, self.bytenr)?;
        write_le_u64(block, 0x38, self.flags)?;
        write_bytes(block, 0x40, &self.chunk_tree_uuid)?;
        write_le_u64(block, 0x50, self.generation)?;
        write_le_u64(block, 0x58, self.owner)?;
        write_le_u32(block, 0x60, self.nritems)?;
        write_u8(block, 0x64, self.level)?;
        Ok(())
    }

    /// Validate the header against the block it was parsed from.
    ///
    /// Checks:
    /// - `bytenr` matches `expected_bytenr` (if provided).
    /// - `level` does not exceed the maximum tree depth.
    /// - `nritems` fits within the block, using the leaf or internal entry
    ///   size according to `level`.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }

        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(HEADER_SIZE);
        let entry_size = if self.level == 0 {
            LEAF_ITEM_SIZE
        } else {
            KEY_PTR_SIZE
        };
        let max_items = payload_space / entry_size;
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

        if nritems > max_items {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Compute the crc32c checksum of a tree block: everything after the
/// 32-byte csum field is covered.
#[must_use]
pub fn compute_block_csum(block: &[u8]) -> u32 {
    crc32c::crc32c(&block[0x20.min(block.len())..])
}

/// Stamp the block's crc32c into the first 4 csum bytes, zeroing the rest
/// of the 32-byte field first.
pub fn stamp_block_csum(block: &mut [u8]) -> Result<(), ParseError> {
    if block.len() < 0x20 {
        return Err(ParseError::InsufficientData {
            needed: 0x20,
            offset: 0,
            actual: block.len(),
        });
    }
    block[0x00..0x20].fill(0);
    let sum = compute_block_csum(block);
    block[0x00..0x04].copy_from_slice(&sum.to_le_bytes());
    Ok(())
}

/// Check the stored crc32c against the block contents.
#[must_use]
pub fn block_csum_matches(block: &[u8]) -> bool {
    if block.len() < 0x20 {
        return false;
    }
    let stored = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    stored == compute_block_csum(block)
}

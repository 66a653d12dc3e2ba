//! Superblock codec.
//!
//! Parsing validates magic and geometry the way mount-time checks do;
//! encoding patches known fields into an existing 4096-byte region so that
//! bytes the rescue flows never touch (backup roots, reserved space) stay
//! exactly as read.

use crate::item::DevItem;
use btr_types::{
    BTRFS_MAGIC, ParseError, SUPER_INFO_SIZE, SYS_CHUNK_ARRAY_MAX, csum_type_size, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, read_u8, trim_nul_padded, usize_to_u32, write_bytes,
    write_le_u16, write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

const LABEL_OFFSET: usize = 0x12B;
const LABEL_LEN: usize = 256;
const DEV_ITEM_OFFSET: usize = 0xC9;
const CACHE_GENERATION_OFFSET: usize = 0x22B;
const UUID_TREE_GENERATION_OFFSET: usize = 0x233;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub log_root_transid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: DevItem,
    pub label: String,
    pub cache_generation: u64,
    pub uuid_tree_generation: u64,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    #[allow(clippy::too_many_lines)]
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let stripesize = read_le_u32(region, 0x9C)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize < sectorsize {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than sectorsize",
            });
        }
        if stripesize != 0 && !stripesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "stripesize",
                reason: "must be zero or power of two",
            });
        }
        if sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "exceeds 256K upper bound",
            });
        }
        if nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 256K upper bound",
            });
        }

        let csum_type = read_le_u16(region, 0xC4)?;
        if csum_type_size(csum_type).is_none() {
            return Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "unknown checksum algorithm",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = SYS_CHUNK_ARRAY_OFFSET
            .checked_add(sys_array_len)
            .ok_or(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "offset overflow",
            })?;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }
        let sys_chunk_array = region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            log_root_transid: read_le_u64(region, 0x68)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            stripesize,
            chunk_root_generation: read_le_u64(region, 0xA4)?,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type,
            root_level: read_u8(region, 0xC6)?,
            chunk_root_level: read_u8(region, 0xC7)?,
            log_root_level: read_u8(region, 0xC8)?,
            dev_item: DevItem::parse_at(region, DEV_ITEM_OFFSET)?,
            label: trim_nul_padded(&read_fixed::<LABEL_LEN>(region, LABEL_OFFSET)?),
            cache_generation: read_le_u64(region, CACHE_GENERATION_OFFSET)?,
            uuid_tree_generation: read_le_u64(region, UUID_TREE_GENERATION_OFFSET)?,
            sys_chunk_array_size,
            sys_chunk_array,
        })
    }

    /// Patch all known fields into `region`, leaving unparsed bytes as-is.
    ///
    /// Does not stamp the checksum; callers run [`stamp_super_csum`] after
    /// the last field write.
    pub fn write_to_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        if self.sys_chunk_array.len() > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "exceeds 2048 byte limit",
            });
        }

        write_bytes(region, 0x00, &self.csum)?;
        write_bytes(region, 0x20, &self.fsid)?;
        write_le_u64(region, 0x30, self.bytenr)?;
        write_le_u64(region, 0x38, self.flags)?;
        write_le_u64(region, 0x40, self.magic)?;
        write_le_u64(region, 0x48, self.generation)?;
        write_le_u64(region, 0x50, self.root)?;
        write_le_u64(region, 0x58, self.chunk_root)?;
        write_le_u64(region, 0x60, self.log_root)?;
        write_le_u64(region, 0x68, self.log_root_transid)?;
        write_le_u64(region, 0x70, self.total_bytes)?;
        write_le_u64(region, 0x78, self.bytes_used)?;
        write_le_u64(region, 0x80, self.root_dir_objectid)?;
        write_le_u64(region, 0x88, self.num_devices)?;
        write_le_u32(region, 0x90, self.sectorsize)?;
        write_le_u32(region, 0x94, self.nodesize)?;
        write_le_u32(region, 0x9C, self.stripesize)?;
        write_le_u32(
            region,
            0xA0,
            usize_to_u32(self.sys_chunk_array.len(), "sys_chunk_array_size")?,
        )?;
        write_le_u64(region, 0xA4, self.chunk_root_generation)?;
        write_le_u64(region, 0xAC, self.compat_flags)?;
        write_le_u64(region, 0xB4, self.compat_ro_flags)?;
        write_le_u64(region, 0xBC, self.incompat_flags)?;
        write_le_u16(region, 0xC4, self.csum_type)?;
        write_u8(region, 0xC6, self.root_level)?;
        write_u8(region, 0xC7, self.chunk_root_level)?;
        write_u8(region, 0xC8, self.log_root_level)?;
        self.dev_item.write_at(region, DEV_ITEM_OFFSET)?;

        let mut label = [0_u8; LABEL_LEN];
        let copy_len = self.label.len().min(LABEL_LEN - 1);
        label[..copy_len].copy_from_slice(&self.label.as_bytes()[..copy_len]);
        write_bytes(region, LABEL_OFFSET, &label)?;

        write_le_u64(region, CACHE_GENERATION_OFFSET, self.cache_generation)?;
        write_le_u64(region, UUID_TREE_GENERATION_OFFSET, self.uuid_tree_generation)?;

        let mut array = [0_u8; SYS_CHUNK_ARRAY_MAX];
        array[..self.sys_chunk_array.len()].copy_from_slice(&self.sys_chunk_array);
        write_bytes(region, SYS_CHUNK_ARRAY_OFFSET, &array)?;
        Ok(())
    }
}

/// Compute the superblock crc32c: everything after the 32-byte csum field.
#[must_use]
pub fn compute_super_csum(region: &[u8]) -> u32 {
    crc32c::crc32c(&region[0x20.min(region.len())..SUPER_INFO_SIZE.min(region.len())])
}

/// Stamp the superblock crc32c into the csum field.
pub fn stamp_super_csum(region: &mut [u8]) -> Result<(), ParseError> {
    if region.len() < SUPER_INFO_SIZE {
        return Err(ParseError::InsufficientData {
            needed: SUPER_INFO_SIZE,
            offset: 0,
            actual: region.len(),
        });
    }
    region[0x00..0x20].fill(0);
    let sum = compute_super_csum(region);
    region[0x00..0x04].copy_from_slice(&sum.to_le_bytes());
    Ok(())
}

/// Check the stored superblock crc32c against the region contents.
#[must_use]
pub fn super_csum_matches(region: &[u8]) -> bool {
    if region.len() < SUPER_INFO_SIZE {
        return false;
    }
    let stored = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
    stored == compute_super_csum(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btr_types::{CSUM_TYPE_CRC32C, SUPER_INFO_OFFSET};

    fn sample_dev_item() -> DevItem {
        DevItem {
            devid: 1,
            total_bytes: 256 * 1024 * 1024,
            bytes_used: 16 * 1024 * 1024,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            dev_type: 0,
            generation: 0,
            start_offset: 0,
            dev_group: 0,
            seek_speed: 0,
            bandwidth: 0,
            uuid: [0x11; 16],
            fsid: [0x22; 16],
        }
    }

    fn sample_super() -> Superblock {
        Superblock {
            csum: [0; 32],
            fsid: [0x22; 16],
            bytenr: SUPER_INFO_OFFSET,
            flags: 1,
            magic: BTRFS_MAGIC,
            generation: 7,
            root: 0x50_0000,
            chunk_root: 0x40_0000,
            log_root: 0,
            log_root_transid: 0,
            total_bytes: 256 * 1024 * 1024,
            bytes_used: 16 * 1024 * 1024,
            root_dir_objectid: 6,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: 16384,
            stripesize: 4096,
            chunk_root_generation: 7,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: CSUM_TYPE_CRC32C,
            root_level: 0,
            chunk_root_level: 0,
            log_root_level: 0,
            dev_item: sample_dev_item(),
            label: "rescue".to_owned(),
            cache_generation: 7,
            uuid_tree_generation: 7,
            sys_chunk_array_size: 0,
            sys_chunk_array: Vec::new(),
        }
    }

    #[test]
    fn round_trip_region() {
        let sb = sample_super();
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");
        let parsed = Superblock::parse_region(&region).expect("parse");
        assert_eq!(parsed, sb);
        assert_eq!(parsed.label, "rescue");
        assert_eq!(parsed.cache_generation, 7);
        assert_eq!(parsed.uuid_tree_generation, 7);
    }

    #[test]
    fn rejects_bad_magic() {
        let region = vec![0_u8; SUPER_INFO_SIZE];
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_non_power_of_two_sectorsize() {
        let sb = sample_super();
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");
        region[0x90..0x94].copy_from_slice(&3000_u32.to_le_bytes());
        let err = Superblock::parse_region(&region).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "sectorsize", .. }),
            "expected sectorsize error, got: {err:?}"
        );
    }

    #[test]
    fn rejects_nodesize_below_sectorsize() {
        let mut sb = sample_super();
        sb.nodesize = 2048;
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");
        let err = Superblock::parse_region(&region).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "nodesize", .. }),
            "expected nodesize error, got: {err:?}"
        );
    }

    #[test]
    fn rejects_unknown_csum_type() {
        let sb = sample_super();
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");
        region[0xC4..0xC6].copy_from_slice(&99_u16.to_le_bytes());
        let err = Superblock::parse_region(&region).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "csum_type", .. }),
            "expected csum_type error, got: {err:?}"
        );
    }

    #[test]
    fn rejects_oversized_sys_chunk_array() {
        let sb = sample_super();
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");
        region[0xA0..0xA4].copy_from_slice(&4096_u32.to_le_bytes());
        let err = Superblock::parse_region(&region).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField { field: "sys_chunk_array_size", .. }
            ),
            "expected sys_chunk_array_size error, got: {err:?}"
        );
    }

    #[test]
    fn csum_stamp_and_verify() {
        let sb = sample_super();
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        sb.write_to_region(&mut region).expect("encode");

        stamp_super_csum(&mut region).expect("stamp");
        assert!(super_csum_matches(&region));

        region[0x48] ^= 0x01;
        assert!(!super_csum_matches(&region));
    }

    #[test]
    fn encode_preserves_unparsed_bytes() {
        // Backup root area and reserved space survive a field patch.
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        region[0xB2B] = 0xEE;
        sample_super().write_to_region(&mut region).expect("encode");
        assert_eq!(region[0xB2B], 0xEE);
    }
}

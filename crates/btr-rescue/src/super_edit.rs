//! Direct superblock edits.
//!
//! Three small rescue flows that only touch superblock copies: clearing the
//! log tree pointer, re-aligning the recorded device size, and invalidating
//! the v1 free space cache. Each edit is applied to every valid copy so
//! mirrors stay in agreement.

use crate::open::{load_superblock, read_super_region, super_copy_offsets};
use btr_block::ByteDevice;
use btr_error::{BtrError, Result};
use btr_ondisk::{Superblock, stamp_super_csum, super_csum_matches};
use btr_types::{COMPAT_RO_FREE_SPACE_TREE, COMPAT_RO_FREE_SPACE_TREE_VALID};
use serde::Serialize;
use tracing::{info, warn};

/// Apply `mutate` to every valid superblock copy and rewrite it. Invalid
/// copies are skipped with a warning; super-recover is the tool for those.
pub(crate) fn edit_super_copies<D, F>(device: &D, mut mutate: F) -> Result<usize>
where
    D: ByteDevice,
    F: FnMut(&mut Superblock),
{
    let mut updated = 0_usize;
    for offset in super_copy_offsets(device.len_bytes()) {
        let mut region = read_super_region(device, offset)?;
        if !super_csum_matches(&region) {
            warn!(offset, "skipping superblock copy with bad checksum");
            continue;
        }
        let mut sb = match Superblock::parse_region(&region) {
            Ok(sb) => sb,
            Err(err) => {
                warn!(offset, %err, "skipping unparseable superblock copy");
                continue;
            }
        };
        mutate(&mut sb);
        sb.write_to_region(&mut region)
            .map_err(|err| BtrError::Parse(err.to_string()))?;
        stamp_super_csum(&mut region).map_err(|err| BtrError::Parse(err.to_string()))?;
        device.write_all_at(offset, &region)?;
        updated += 1;
    }
    device.sync()?;
    Ok(updated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroLogStatus {
    Cleared,
    AlreadyClear,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZeroLogReport {
    pub status: ZeroLogStatus,
    pub previous_log_root: u64,
    pub copies_updated: usize,
}

impl ZeroLogReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Drop the log tree so mount-time log replay is skipped.
pub fn zero_log<D: ByteDevice>(device: &D) -> Result<ZeroLogReport> {
    let sb = load_superblock(device)?;
    if sb.log_root == 0 && sb.log_root_transid == 0 && sb.log_root_level == 0 {
        return Ok(ZeroLogReport {
            status: ZeroLogStatus::AlreadyClear,
            previous_log_root: 0,
            copies_updated: 0,
        });
    }
    let copies_updated = edit_super_copies(device, |copy| {
        copy.log_root = 0;
        copy.log_root_transid = 0;
        copy.log_root_level = 0;
    })?;
    info!(previous_log_root = sb.log_root, copies_updated, "log tree cleared");
    Ok(ZeroLogReport {
        status: ZeroLogStatus::Cleared,
        previous_log_root: sb.log_root,
        copies_updated,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixDeviceSizeStatus {
    Fixed,
    AlreadyAligned,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixDeviceSizeReport {
    pub status: FixDeviceSizeStatus,
    pub old_total_bytes: u64,
    pub new_total_bytes: u64,
    pub copies_updated: usize,
}

impl FixDeviceSizeReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

/// Rewrite the recorded filesystem and device sizes to the sector-aligned
/// size of the underlying device.
pub fn fix_device_size<D: ByteDevice>(device: &D) -> Result<FixDeviceSizeReport> {
    let sb = load_superblock(device)?;
    let aligned = align_down(device.len_bytes(), u64::from(sb.sectorsize));
    if sb.total_bytes == aligned && sb.dev_item.total_bytes == aligned {
        return Ok(FixDeviceSizeReport {
            status: FixDeviceSizeStatus::AlreadyAligned,
            old_total_bytes: sb.total_bytes,
            new_total_bytes: aligned,
            copies_updated: 0,
        });
    }
    let copies_updated = edit_super_copies(device, |copy| {
        copy.total_bytes = aligned;
        copy.dev_item.total_bytes = aligned;
    })?;
    info!(
        old = sb.total_bytes,
        new = aligned,
        copies_updated,
        "device size fixed"
    );
    Ok(FixDeviceSizeReport {
        status: FixDeviceSizeStatus::Fixed,
        old_total_bytes: sb.total_bytes,
        new_total_bytes: aligned,
        copies_updated,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearSpaceCacheStatus {
    Invalidated,
    AlreadyInvalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearSpaceCacheReport {
    pub status: ClearSpaceCacheStatus,
    pub previous_cache_generation: u64,
    pub copies_updated: usize,
}

impl ClearSpaceCacheReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Invalidate the v1 free space cache by forcing `cache_generation` to -1.
/// Filesystems using the free space tree (v2 cache) are rejected; that
/// cache lives in its own tree, not behind this generation counter.
pub fn clear_space_cache_v1<D: ByteDevice>(device: &D) -> Result<ClearSpaceCacheReport> {
    let sb = load_superblock(device)?;
    if sb.compat_ro_flags & (COMPAT_RO_FREE_SPACE_TREE | COMPAT_RO_FREE_SPACE_TREE_VALID) != 0 {
        return Err(BtrError::InvalidArgument(
            "filesystem uses the free space tree (v2 cache), not the v1 space cache".to_owned(),
        ));
    }
    if sb.cache_generation == u64::MAX {
        return Ok(ClearSpaceCacheReport {
            status: ClearSpaceCacheStatus::AlreadyInvalidated,
            previous_cache_generation: sb.cache_generation,
            copies_updated: 0,
        });
    }
    let copies_updated = edit_super_copies(device, |copy| {
        copy.cache_generation = u64::MAX;
    })?;
    info!(
        previous = sb.cache_generation,
        copies_updated, "v1 space cache invalidated"
    );
    Ok(ClearSpaceCacheReport {
        status: ClearSpaceCacheStatus::Invalidated,
        previous_cache_generation: sb.cache_generation,
        copies_updated,
    })
}

//! Data checksum verification and repair.
//!
//! Walks every entry in the checksum tree, recomputes the checksum of the
//! data sector it covers on every mirror of the covering chunk, and reports
//! or repairs mismatches depending on the selected mode. A stored checksum
//! is only rewritten when no mirror confirms it; when some mirror still
//! matches, the tree is right and the odd mirror holds bad data.

use crate::open::{ChunkMappedStore, find_root_item, open_filesystem};
use crate::prompt::Prompter;
use btr_block::ByteDevice;
use btr_error::{BtrError, Result};
use btr_ondisk::ChunkMap;
use btr_tree::{CsumConfig, Tree, lookup_csum};
use btr_types::{CSUM_TREE_OBJECTID, CSUM_TYPE_CRC32C};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Report mismatches, write nothing.
    ReadOnly,
    /// Ask before rewriting a stored checksum that no mirror confirms.
    Interactive,
    /// Rewrite every stale entry from the data on the given mirror,
    /// 1-based, without asking.
    UpdateFromMirror { mirror: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct FixChecksumReport {
    pub sectors_checked: usize,
    pub mismatches: usize,
    pub repaired: usize,
}

impl FixChecksumReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn read_sector<D: ByteDevice>(
    device: &D,
    map: &ChunkMap,
    logical: u64,
    sectorsize: usize,
    stripe: usize,
) -> Result<Vec<u8>> {
    let mapping = map
        .map_stripe(logical, stripe)
        .map_err(|err| BtrError::Parse(err.to_string()))?
        .ok_or_else(|| {
            BtrError::NotFound(format!("data sector {logical} not covered by any chunk"))
        })?;
    let mut buf = vec![0_u8; sectorsize];
    device.read_exact_at(mapping.physical, &mut buf)?;
    Ok(buf)
}

pub fn fix_data_checksum<D: ByteDevice, P: Prompter>(
    device: &D,
    mode: RepairMode,
    prompter: &mut P,
) -> Result<FixChecksumReport> {
    // Mirror numbers are 1-based; validate before touching the device.
    // `None` means verify against every stripe of the covering chunk.
    let explicit_stripe = match mode {
        RepairMode::UpdateFromMirror { mirror: 0 } => {
            return Err(BtrError::InvalidArgument(
                "mirror numbers start at 1".to_owned(),
            ));
        }
        RepairMode::UpdateFromMirror { mirror } => Some(mirror - 1),
        RepairMode::ReadOnly | RepairMode::Interactive => None,
    };

    let info = open_filesystem(device)?;
    let sb = info.superblock;
    if sb.csum_type != CSUM_TYPE_CRC32C {
        return Err(BtrError::RescueFailed(format!(
            "checksum type {} is not supported, only crc32c",
            sb.csum_type
        )));
    }
    let mut store = ChunkMappedStore::new(device, info.chunk_map, sb.nodesize as usize);
    let cfg = CsumConfig::new(sb.sectorsize);
    let sectorsize = sb.sectorsize as usize;

    let Some(csum_root) = find_root_item(&store, sb.root, CSUM_TREE_OBJECTID)? else {
        return Ok(FixChecksumReport {
            sectors_checked: 0,
            mismatches: 0,
            repaired: 0,
        });
    };
    let mut tree = Tree::open(&store, csum_root.bytenr)?;

    let mut sectors_checked = 0_usize;
    let mut mismatches = 0_usize;
    // (sector logical, checksum to store) collected during the scan and
    // applied afterwards so the walk never mutates the leaves under it.
    let mut pending: Vec<(u64, [u8; 4])> = Vec::new();

    let mut path = Some(tree.first_leaf(&store)?);
    while let Some(cur) = path {
        let leaf = tree.leaf(&cur)?;
        let nritems = leaf.nritems();
        for slot in 0..nritems {
            let leaf = tree.leaf(&cur)?;
            let key = leaf.key(slot)?;
            if !key.is_csum() {
                continue;
            }
            let entries = leaf.item_data(slot)?.len() / cfg.csum_size;
            for entry in 0..entries {
                let logical = key.offset + (entry as u64) * u64::from(cfg.sectorsize);
                let stored: [u8; 4] = {
                    let data = tree.leaf(&cur)?.item_data(slot)?;
                    let start = entry * cfg.csum_size;
                    [data[start], data[start + 1], data[start + 2], data[start + 3]]
                };
                sectors_checked += 1;

                if let Some(stripe) = explicit_stripe {
                    let sector =
                        read_sector(device, store.chunk_map(), logical, sectorsize, stripe)?;
                    let actual = crc32c::crc32c(&sector).to_le_bytes();
                    if stored == actual {
                        continue;
                    }
                    mismatches += 1;
                    warn!(
                        logical,
                        mirror = stripe + 1,
                        stored = u32::from_le_bytes(stored),
                        actual = u32::from_le_bytes(actual),
                        "data checksum mismatch"
                    );
                    pending.push((logical, actual));
                    continue;
                }

                let mirrors = store
                    .chunk_map()
                    .stripe_count(logical)
                    .map_err(|err| BtrError::Parse(err.to_string()))?
                    .ok_or_else(|| {
                        BtrError::NotFound(format!(
                            "data sector {logical} not covered by any chunk"
                        ))
                    })?;
                let mut stored_confirmed = false;
                let mut disagreeing: Vec<[u8; 4]> = Vec::new();
                for stripe in 0..mirrors {
                    let sector =
                        read_sector(device, store.chunk_map(), logical, sectorsize, stripe)?;
                    let actual = crc32c::crc32c(&sector).to_le_bytes();
                    if stored == actual {
                        stored_confirmed = true;
                    } else {
                        warn!(
                            logical,
                            mirror = stripe + 1,
                            stored = u32::from_le_bytes(stored),
                            actual = u32::from_le_bytes(actual),
                            "data checksum mismatch"
                        );
                        disagreeing.push(actual);
                    }
                }
                if disagreeing.is_empty() {
                    continue;
                }
                mismatches += 1;
                if stored_confirmed {
                    // The tree is right and the mismatching mirror carries
                    // bad data; the entry must stay as it is.
                    warn!(
                        logical,
                        "stored checksum confirmed by another mirror, not rewriting"
                    );
                    continue;
                }
                if let RepairMode::Interactive = mode {
                    let question = format!(
                        "no mirror matches the stored checksum for sector at {logical}; \
                         update it from mirror 1?"
                    );
                    if prompter.confirm(&question)? {
                        pending.push((logical, disagreeing[0]));
                    }
                }
            }
        }
        path = tree.next_leaf(&store, &cur)?;
    }

    let repaired = pending.len();
    for (logical, csum) in pending {
        let (entry_path, entry) = lookup_csum(&mut tree, &store, &cfg, logical)?;
        let slot = entry_path.leaf_slot();
        let data = tree.leaf_mut(&entry_path)?.item_data_mut(slot)?;
        let start = entry * cfg.csum_size;
        data[start..start + cfg.csum_size].copy_from_slice(&csum);
    }
    if repaired > 0 {
        tree.commit(&mut store, sb.generation)?;
        info!(repaired, "checksum tree updated");
    }

    Ok(FixChecksumReport {
        sectors_checked,
        mismatches,
        repaired,
    })
}

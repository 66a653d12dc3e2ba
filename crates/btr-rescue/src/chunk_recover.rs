//! Chunk tree reconstruction.
//!
//! When the sys chunk array or the chunk tree itself is damaged, the chunk
//! items usually still sit on disk inside old chunk tree leaves. The flow
//! scans the whole device for leaves owned by the chunk tree, collects
//! every chunk item it can trust, and rebuilds a single-leaf chunk tree in
//! place, rewriting the sys chunk array in every superblock copy to match.

use crate::open::load_superblock;
use crate::prompt::Prompter;
use crate::super_edit::edit_super_copies;
use btr_block::ByteDevice;
use btr_error::{BtrError, Result};
use btr_ondisk::{
    ChunkEntry, ChunkMap, Header, block_csum_matches, encode_chunk_payload, encode_sys_chunk_array,
    parse_chunk_payload,
};
use btr_tree::TreeBlock;
use btr_types::{
    BLOCK_GROUP_SYSTEM, CHUNK_ITEM_KEY, CHUNK_TREE_OBJECTID, DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, Key,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRecoveryStatus {
    Recovered,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecoveryReport {
    pub status: ChunkRecoveryStatus,
    /// Chunk tree leaves that passed the checksum and ownership checks.
    pub leaves_found: usize,
    pub chunks_recovered: usize,
    pub copies_updated: usize,
}

impl ChunkRecoveryReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

struct ScanResult {
    leaves_found: usize,
    /// Logical chunk start -> (generation of the leaf it came from, entry).
    candidates: HashMap<u64, (u64, ChunkEntry)>,
    chunk_tree_uuid: Option<[u8; 16]>,
}

/// Sweep the device at nodesize granularity for checksum-valid leaves
/// owned by the chunk tree, keeping the newest copy of every chunk item.
fn scan_for_chunk_leaves<D: ByteDevice>(
    device: &D,
    fsid: [u8; 16],
    nodesize: usize,
) -> Result<ScanResult> {
    let mut result = ScanResult {
        leaves_found: 0,
        candidates: HashMap::new(),
        chunk_tree_uuid: None,
    };
    let step = nodesize as u64;
    let mut buf = vec![0_u8; nodesize];
    let mut offset = 0_u64;
    while offset + step <= device.len_bytes() {
        device.read_exact_at(offset, &mut buf)?;
        let physical = offset;
        offset += step;

        let Ok(header) = Header::parse_from_block(&buf) else {
            continue;
        };
        if header.fsid != fsid || header.owner != CHUNK_TREE_OBJECTID || header.level != 0 {
            continue;
        }
        if header.validate(nodesize, None).is_err() || !block_csum_matches(&buf) {
            continue;
        }
        let Ok(leaf) = TreeBlock::from_bytes(header.bytenr, buf.clone(), false) else {
            continue;
        };
        result.leaves_found += 1;
        result.chunk_tree_uuid.get_or_insert(header.chunk_tree_uuid);
        debug!(
            physical,
            bytenr = header.bytenr,
            generation = header.generation,
            "chunk tree leaf candidate"
        );

        for slot in 0..leaf.nritems() {
            let key = leaf.key(slot)?;
            if key.item_type != CHUNK_ITEM_KEY {
                continue;
            }
            let data = leaf.item_data(slot)?;
            let entry = match parse_chunk_payload(data, 0, key.offset) {
                Ok((entry, _)) => entry,
                Err(err) => {
                    warn!(bytenr = header.bytenr, slot, %err, "skipping unparseable chunk item");
                    continue;
                }
            };
            let newer = match result.candidates.get(&key.offset) {
                Some((generation, _)) => header.generation > *generation,
                None => true,
            };
            if newer {
                result.candidates.insert(key.offset, (header.generation, entry));
            }
        }
    }
    Ok(result)
}

/// Drop candidates whose logical range overlaps a higher-generation one.
/// Candidates at different starts can overlap when the scan picks up leaves
/// from different eras of the chunk tree; the newer leaf wins the whole
/// range, the loser is dropped entirely rather than split.
fn resolve_overlaps(mut candidates: Vec<(u64, ChunkEntry)>) -> Vec<ChunkEntry> {
    candidates.sort_by_key(|(_, entry)| entry.key.offset);
    let mut kept: Vec<(u64, ChunkEntry)> = Vec::new();
    'candidates: for (generation, entry) in candidates {
        while let Some((kept_generation, last)) = kept.last() {
            let last_end = last.key.offset.saturating_add(last.length);
            if entry.key.offset >= last_end {
                break;
            }
            if generation <= *kept_generation {
                warn!(
                    logical = entry.key.offset,
                    generation, "dropping stale chunk overlapping a newer one"
                );
                continue 'candidates;
            }
            warn!(
                logical = last.key.offset,
                generation = *kept_generation,
                "dropping stale chunk overlapped by a newer one"
            );
            kept.pop();
        }
        kept.push((generation, entry));
    }
    kept.into_iter().map(|(_, entry)| entry).collect()
}

pub fn chunk_recover<D: ByteDevice, P: Prompter>(
    device: &D,
    prompter: &mut P,
) -> Result<ChunkRecoveryReport> {
    let sb = load_superblock(device)?;
    let nodesize = sb.nodesize as usize;
    let scan = scan_for_chunk_leaves(device, sb.fsid, nodesize)?;

    let failed = |leaves_found| ChunkRecoveryReport {
        status: ChunkRecoveryStatus::Failed,
        leaves_found,
        chunks_recovered: 0,
        copies_updated: 0,
    };
    let (Some(chunk_tree_uuid), false) = (scan.chunk_tree_uuid, scan.candidates.is_empty()) else {
        warn!("no usable chunk tree leaves found on the device");
        return Ok(failed(scan.leaves_found));
    };

    let entries = resolve_overlaps(scan.candidates.into_values().collect());

    // The rebuilt tree has to land inside a recovered system chunk, at the
    // logical address the superblock already points to.
    let map = ChunkMap::new(entries.clone());
    let root_physical = match map
        .map(sb.chunk_root)
        .map_err(|err| BtrError::Parse(err.to_string()))?
    {
        Some(mapping) => mapping.physical,
        None => {
            warn!(
                chunk_root = sb.chunk_root,
                "no recovered chunk covers the chunk tree root"
            );
            return Ok(failed(scan.leaves_found));
        }
    };

    let question = format!(
        "rebuild the chunk tree at {} from {} recovered chunks?",
        sb.chunk_root,
        entries.len()
    );
    if !prompter.confirm(&question)? {
        return Ok(ChunkRecoveryReport {
            status: ChunkRecoveryStatus::Aborted,
            leaves_found: scan.leaves_found,
            chunks_recovered: entries.len(),
            copies_updated: 0,
        });
    }

    let mut leaf = TreeBlock::new_empty(
        sb.chunk_root,
        nodesize,
        0,
        CHUNK_TREE_OBJECTID,
        sb.generation,
        sb.fsid,
        chunk_tree_uuid,
    )?;
    let mut dev_item_payload = vec![0_u8; 98];
    sb.dev_item
        .write_at(&mut dev_item_payload, 0)
        .map_err(|err| BtrError::Parse(err.to_string()))?;
    leaf.insert_item_with(
        0,
        Key::new(DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, sb.dev_item.devid),
        &dev_item_payload,
    )?;
    for (slot, entry) in entries.iter().enumerate() {
        let payload = encode_chunk_payload(entry).map_err(|err| BtrError::Parse(err.to_string()))?;
        leaf.insert_item_with(slot + 1, entry.key, &payload)?;
    }
    leaf.stamp_csum()?;
    device.write_all_at(root_physical, leaf.buf())?;

    let sys_entries: Vec<ChunkEntry> = entries
        .iter()
        .filter(|e| e.chunk_type & BLOCK_GROUP_SYSTEM != 0)
        .cloned()
        .collect();
    let sys_array =
        encode_sys_chunk_array(&sys_entries).map_err(|err| BtrError::Parse(err.to_string()))?;
    let generation = sb.generation;
    let copies_updated = edit_super_copies(device, |copy| {
        copy.chunk_root_generation = generation;
        copy.chunk_root_level = 0;
        copy.sys_chunk_array = sys_array.clone();
    })?;
    info!(
        chunks = entries.len(),
        copies_updated, "chunk tree rebuilt"
    );
    Ok(ChunkRecoveryReport {
        status: ChunkRecoveryStatus::Recovered,
        leaves_found: scan.leaves_found,
        chunks_recovered: entries.len(),
        copies_updated,
    })
}

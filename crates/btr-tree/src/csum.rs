//! Data checksum tree engine.
//!
//! Checksum items live under (`EXTENT_CSUM_OBJECTID`, `EXTENT_CSUM_KEY`,
//! logical bytenr) and carry one checksum per sector of the covered data
//! range. Adjacent ranges share an item until it reaches the maximum entry
//! count, after which a new item starts. Deleting a sub-range truncates,
//! splits, or drops items so that every remaining entry still describes
//! exactly one live sector.

use crate::store::BlockStore;
use crate::tree::{Tree, TreePath};
use btr_error::{BtrError, Result};
use btr_types::{Key, LEAF_ITEM_SIZE};

/// Sector and checksum geometry of a filesystem.
#[derive(Debug, Clone, Copy)]
pub struct CsumConfig {
    pub sectorsize: u32,
    pub csum_size: usize,
}

impl CsumConfig {
    #[must_use]
    pub fn new(sectorsize: u32) -> Self {
        // crc32c occupies 4 bytes per sector.
        Self {
            sectorsize,
            csum_size: 4,
        }
    }
}

/// Largest number of checksum entries a single item may carry.
///
/// One directory entry is reserved for a neighbor insertion and one entry
/// is held back so a split always has room to move.
#[must_use]
pub fn max_csum_entries(leaf_data_size: usize, csum_size: usize) -> usize {
    (leaf_data_size - 2 * LEAF_ITEM_SIZE) / csum_size - 1
}

/// Find the checksum entry covering `bytenr`.
///
/// Returns the path to the covering item and the entry index within it, or
/// `NotFound` when no item covers the sector.
pub fn lookup_csum<S: BlockStore>(
    tree: &mut Tree,
    store: &S,
    cfg: &CsumConfig,
    bytenr: u64,
) -> Result<(TreePath, usize)> {
    match probe_csum(tree, store, cfg, bytenr)? {
        CsumProbe::Covered { path, entry } => Ok((path, entry)),
        CsumProbe::AtEnd { .. } | CsumProbe::Miss => Err(BtrError::NotFound(format!(
            "no checksum item covers bytenr {bytenr}"
        ))),
    }
}

/// Read the stored checksum bytes for the sector at `bytenr`.
pub fn read_csum<S: BlockStore>(
    tree: &mut Tree,
    store: &S,
    cfg: &CsumConfig,
    bytenr: u64,
) -> Result<Vec<u8>> {
    let (path, entry) = lookup_csum(tree, store, cfg, bytenr)?;
    let leaf = tree.leaf(&path)?;
    let data = leaf.item_data(path.leaf_slot())?;
    let start = entry * cfg.csum_size;
    Ok(data[start..start + cfg.csum_size].to_vec())
}

/// Compute and record checksums for `data` located at logical `bytenr`.
///
/// Both `bytenr` and the data length must be sector aligned. Existing
/// entries for the same sectors are overwritten in place; new sectors
/// extend an adjacent item when possible and start a new item otherwise.
pub fn add_data_csums<S: BlockStore>(
    tree: &mut Tree,
    store: &mut S,
    cfg: &CsumConfig,
    bytenr: u64,
    data: &[u8],
) -> Result<()> {
    let sector = usize_sector(cfg)?;
    if bytenr % sector as u64 != 0 || data.len() % sector != 0 {
        return Err(BtrError::InvalidArgument(format!(
            "checksum range {bytenr}+{} not aligned to sectorsize {}",
            data.len(),
            cfg.sectorsize
        )));
    }
    for (i, chunk) in data.chunks(sector).enumerate() {
        let mut csum = vec![0_u8; cfg.csum_size];
        csum[..4].copy_from_slice(&crc32c::crc32c(chunk).to_le_bytes());
        insert_one_csum(tree, store, cfg, bytenr + (i * sector) as u64, &csum)?;
    }
    Ok(())
}

/// Remove every checksum entry for the sectors in `[bytenr, bytenr + len)`.
///
/// Items entirely inside the range are deleted, items straddling an edge
/// are truncated, and an item spanning the whole range is split with the
/// covered middle removed.
pub fn delete_csum_range<S: BlockStore>(
    tree: &mut Tree,
    store: &mut S,
    cfg: &CsumConfig,
    bytenr: u64,
    len: u64,
) -> Result<()> {
    let sector = u64::from(cfg.sectorsize);
    if bytenr % sector != 0 || len % sector != 0 || len == 0 {
        return Err(BtrError::InvalidArgument(format!(
            "checksum range {bytenr}+{len} not aligned to sectorsize {}",
            cfg.sectorsize
        )));
    }
    let end_byte = bytenr + len;

    loop {
        let (mut path, exact) = tree.search(store, Key::csum(end_byte - 1))?;
        if !exact {
            if path.slots[0] == 0 {
                break;
            }
            path.slots[0] -= 1;
        }
        let slot = path.slots[0];
        let (key, item_size) = {
            let leaf = tree.leaf(&path)?;
            (leaf.key(slot)?, leaf.item_size(slot)? as usize)
        };
        if !key.is_csum() || key.offset >= end_byte {
            break;
        }
        let csum_end = key.offset + (item_size / cfg.csum_size) as u64 * sector;
        if csum_end <= bytenr {
            break;
        }

        if key.offset >= bytenr && csum_end <= end_byte {
            tree.delete_items(store, &path, 1)?;
        } else if key.offset < bytenr && csum_end > end_byte {
            // The range sits strictly inside this item. Zero the covered
            // entries, then split at the range start so the tail becomes
            // its own item and the next pass can truncate it.
            let offset = ((bytenr - key.offset) / sector) as usize * cfg.csum_size;
            let shift_len = (len / sector) as usize * cfg.csum_size;
            {
                let leaf = tree.leaf_mut(&path)?;
                let data = leaf.item_data_mut(slot)?;
                data[offset..offset + shift_len].fill(0);
            }
            match tree
                .leaf_mut(&path)?
                .split_item(slot, Key::csum(bytenr), offset)
            {
                Ok(()) => {}
                Err(err) if err.is_no_space() => {
                    // No directory room in this leaf; split the leaf and
                    // redo the pass with a fresh search.
                    tree.make_leaf_room(store, &path)?;
                }
                Err(err) => return Err(err),
            }
        } else {
            truncate_one_csum(tree, &path, key, bytenr, end_byte, cfg)?;
            if key.offset < bytenr {
                break;
            }
        }
    }
    Ok(())
}

enum CsumProbe {
    /// Item covering the sector, with the entry index inside it.
    Covered { path: TreePath, entry: usize },
    /// Item ending exactly at the sector; a candidate for extension.
    AtEnd { path: TreePath, entries: usize },
    Miss,
}

fn probe_csum<S: BlockStore>(
    tree: &mut Tree,
    store: &S,
    cfg: &CsumConfig,
    bytenr: u64,
) -> Result<CsumProbe> {
    let sector = u64::from(cfg.sectorsize);
    let (mut path, exact) = tree.search(store, Key::csum(bytenr))?;
    if exact {
        return Ok(CsumProbe::Covered { path, entry: 0 });
    }
    if path.slots[0] == 0 {
        return Ok(CsumProbe::Miss);
    }
    path.slots[0] -= 1;
    let slot = path.slots[0];
    let (key, item_size) = {
        let leaf = tree.leaf(&path)?;
        (leaf.key(slot)?, leaf.item_size(slot)? as usize)
    };
    if !key.is_csum() || key.offset > bytenr {
        return Ok(CsumProbe::Miss);
    }
    let entries = item_size / cfg.csum_size;
    let entry = ((bytenr - key.offset) / sector) as usize;
    if entry < entries {
        Ok(CsumProbe::Covered { path, entry })
    } else if entry == entries {
        Ok(CsumProbe::AtEnd { path, entries })
    } else {
        Ok(CsumProbe::Miss)
    }
}

fn insert_one_csum<S: BlockStore>(
    tree: &mut Tree,
    store: &mut S,
    cfg: &CsumConfig,
    bytenr: u64,
    csum: &[u8],
) -> Result<()> {
    loop {
        match probe_csum(tree, store, cfg, bytenr)? {
            CsumProbe::Covered { path, entry } => {
                write_entry(tree, &path, cfg, entry, csum)?;
                return Ok(());
            }
            CsumProbe::AtEnd { path, entries } => {
                let slot = path.leaf_slot();
                let (leaf_data_size, free_space) = {
                    let leaf = tree.leaf(&path)?;
                    (leaf.leaf_data_size(), leaf.free_space()?)
                };
                if entries >= max_csum_entries(leaf_data_size, cfg.csum_size) {
                    // Item at maximum size; start a new one.
                    break;
                }
                if free_space >= cfg.csum_size {
                    tree.leaf_mut(&path)?.extend_item(slot, cfg.csum_size)?;
                    write_entry(tree, &path, cfg, entries, csum)?;
                    return Ok(());
                }
                // Leaf out of room but the item can still grow: split the
                // leaf and extend in place on the next pass.
                match tree.make_leaf_room(store, &path) {
                    Ok(()) => continue,
                    // A single-item leaf cannot split; start a new item.
                    Err(err) if err.is_no_space() => break,
                    Err(err) => return Err(err),
                }
            }
            CsumProbe::Miss => break,
        }
    }
    tree.insert_item(store, Key::csum(bytenr), csum)?;
    Ok(())
}

fn write_entry(
    tree: &mut Tree,
    path: &TreePath,
    cfg: &CsumConfig,
    entry: usize,
    csum: &[u8],
) -> Result<()> {
    let slot = path.leaf_slot();
    let leaf = tree.leaf_mut(path)?;
    let data = leaf.item_data_mut(slot)?;
    let start = entry * cfg.csum_size;
    data[start..start + cfg.csum_size].copy_from_slice(csum);
    Ok(())
}

/// Shrink an item overlapping one edge of the deleted range: keep the head
/// when the item starts before the range, keep the tail (rekeyed to the
/// range end) when it extends past it.
fn truncate_one_csum(
    tree: &mut Tree,
    path: &TreePath,
    key: Key,
    bytenr: u64,
    end_byte: u64,
    cfg: &CsumConfig,
) -> Result<()> {
    let sector = u64::from(cfg.sectorsize);
    let slot = path.leaf_slot();
    let item_size = tree.leaf(path)?.item_size(slot)? as usize;
    let csum_end = key.offset + (item_size / cfg.csum_size) as u64 * sector;

    if key.offset < bytenr && csum_end <= end_byte {
        let new_size = ((bytenr - key.offset) / sector) as usize * cfg.csum_size;
        tree.leaf_mut(path)?.truncate_item(slot, new_size, true)?;
    } else if key.offset >= bytenr && csum_end > end_byte {
        let new_size = ((csum_end - end_byte) / sector) as usize * cfg.csum_size;
        tree.leaf_mut(path)?.truncate_item(slot, new_size, false)?;
        tree.set_item_key_safe(path, Key::csum(end_byte))?;
    }
    Ok(())
}

fn usize_sector(cfg: &CsumConfig) -> Result<usize> {
    usize::try_from(cfg.sectorsize).map_err(|_| {
        BtrError::InvalidArgument(format!("sectorsize {} too large", cfg.sectorsize))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBlockStore;
    use btr_types::{EXTENT_CSUM_KEY, EXTENT_CSUM_OBJECTID};
    use std::collections::BTreeMap;

    const BLOCK_SIZE: usize = 1024;
    const SECTOR: u32 = 16;

    fn setup() -> (MemBlockStore, Tree, CsumConfig) {
        let mut store = MemBlockStore::new(BLOCK_SIZE, 0x10_0000);
        let tree = Tree::create_empty(&mut store, 7, 1, [0x11; 16], [0x22; 16]).expect("tree");
        (store, tree, CsumConfig::new(SECTOR))
    }

    fn sector_data(bytenr: u64, sectors: usize) -> Vec<u8> {
        let mut data = vec![0_u8; sectors * SECTOR as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((bytenr as usize + i) % 251) as u8;
        }
        data
    }

    /// Walk every checksum item and rebuild a sector -> csum map, checking
    /// item internal consistency along the way.
    fn collect_csums(tree: &mut Tree, store: &MemBlockStore, cfg: &CsumConfig) -> BTreeMap<u64, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut path = tree.first_leaf(store).expect("first leaf");
        loop {
            let leaf = tree.leaf(&path).expect("leaf");
            for slot in 0..leaf.nritems() {
                let key = leaf.key(slot).expect("key");
                assert!(key.is_csum(), "non-csum key {key} in csum tree");
                let data = leaf.item_data(slot).expect("data");
                assert_eq!(data.len() % cfg.csum_size, 0);
                for (i, entry) in data.chunks(cfg.csum_size).enumerate() {
                    let sector = key.offset + (i as u64) * u64::from(cfg.sectorsize);
                    let prev = out.insert(sector, entry.to_vec());
                    assert!(prev.is_none(), "sector {sector} covered twice");
                }
            }
            match tree.next_leaf(store, &path).expect("next leaf") {
                Some(next) => path = next,
                None => break,
            }
        }
        out
    }

    fn expected_csum(data: &[u8], cfg: &CsumConfig) -> Vec<u8> {
        let mut csum = vec![0_u8; cfg.csum_size];
        csum[..4].copy_from_slice(&crc32c::crc32c(data).to_le_bytes());
        csum
    }

    #[test]
    fn sequential_sectors_share_one_item() {
        let (mut store, mut tree, cfg) = setup();
        let data = sector_data(0, 8);
        add_data_csums(&mut tree, &mut store, &cfg, 0x1000, &data).expect("add");

        let csums = collect_csums(&mut tree, &store, &cfg);
        assert_eq!(csums.len(), 8);
        for (i, chunk) in data.chunks(SECTOR as usize).enumerate() {
            let sector = 0x1000 + (i as u64) * u64::from(SECTOR);
            assert_eq!(csums[&sector], expected_csum(chunk, &cfg));
        }

        // All eight landed in a single item.
        let (path, _) = tree.search(&store, Key::csum(0x1000)).expect("search");
        let leaf = tree.leaf(&path).expect("leaf");
        assert_eq!(leaf.nritems(), 1);
        assert_eq!(leaf.item_size(0).expect("size") as usize, 8 * cfg.csum_size);
    }

    #[test]
    fn overwrite_replaces_in_place() {
        let (mut store, mut tree, cfg) = setup();
        let data = sector_data(0, 4);
        add_data_csums(&mut tree, &mut store, &cfg, 0, &data).expect("add");

        let new_data = sector_data(99, 1);
        add_data_csums(&mut tree, &mut store, &cfg, u64::from(SECTOR), &new_data).expect("add");

        let csums = collect_csums(&mut tree, &store, &cfg);
        assert_eq!(csums.len(), 4);
        assert_eq!(csums[&u64::from(SECTOR)], expected_csum(&new_data, &cfg));
    }

    #[test]
    fn full_item_forces_a_new_one() {
        let (mut store, mut tree, cfg) = setup();
        let leaf_data_size = BLOCK_SIZE - btr_types::HEADER_SIZE;
        let max = max_csum_entries(leaf_data_size, cfg.csum_size);

        let data = sector_data(0, max + 1);
        add_data_csums(&mut tree, &mut store, &cfg, 0, &data).expect("add");

        let csums = collect_csums(&mut tree, &store, &cfg);
        assert_eq!(csums.len(), max + 1);

        // Exactly two items: one at max entries, one holding the spill.
        let (first, _) = tree.search(&store, Key::csum(0)).expect("search");
        let first_size = tree.leaf(&first).expect("leaf").item_size(first.leaf_slot()).expect("size");
        assert_eq!(first_size as usize, max * cfg.csum_size);
        let spill = (max as u64) * u64::from(SECTOR);
        let (_, exact) = tree.search(&store, Key::csum(spill)).expect("search");
        assert!(exact, "spill sector should start a new item");
    }

    #[test]
    fn crowded_leaf_splits_so_the_item_grows_in_place() {
        let (mut store, mut tree, cfg) = setup();
        add_data_csums(&mut tree, &mut store, &cfg, 0, &sector_data(0, 10)).expect("add");

        // Crowd the leaf until less than one entry of room remains.
        let (path, _) = tree.search(&store, Key::csum(0)).expect("search");
        let free = tree.leaf(&path).expect("leaf").free_space().expect("free");
        let filler_len = free - LEAF_ITEM_SIZE - (cfg.csum_size - 1);
        let filler = Key::new(EXTENT_CSUM_OBJECTID, 255, 0);
        tree.insert_item(&mut store, filler, &vec![0xAB_u8; filler_len])
            .expect("filler");

        let next = sector_data(160, 1);
        add_data_csums(&mut tree, &mut store, &cfg, 10 * u64::from(SECTOR), &next)
            .expect("extend");

        // Same item, one entry longer, now alone in its leaf.
        let (path, exact) = tree.search(&store, Key::csum(0)).expect("search");
        assert!(exact);
        let leaf = tree.leaf(&path).expect("leaf");
        assert_eq!(leaf.nritems(), 1);
        assert_eq!(leaf.item_size(0).expect("size") as usize, 11 * cfg.csum_size);
        assert_eq!(
            read_csum(&mut tree, &store, &cfg, 10 * u64::from(SECTOR)).expect("read"),
            expected_csum(&next, &cfg)
        );
    }

    #[test]
    fn lookup_miss_and_hit() {
        let (mut store, mut tree, cfg) = setup();
        add_data_csums(&mut tree, &mut store, &cfg, 0x100, &sector_data(0, 2)).expect("add");

        let (path, entry) = lookup_csum(&mut tree, &store, &cfg, 0x100 + u64::from(SECTOR))
            .expect("lookup");
        assert_eq!(entry, 1);
        assert_eq!(tree.leaf(&path).expect("leaf").key(path.leaf_slot()).expect("key").item_type, EXTENT_CSUM_KEY);

        // One past the end of the item is not covered.
        let err = lookup_csum(&mut tree, &store, &cfg, 0x100 + 2 * u64::from(SECTOR)).unwrap_err();
        assert!(err.is_not_found());
        let err = lookup_csum(&mut tree, &store, &cfg, 0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_whole_item() {
        let (mut store, mut tree, cfg) = setup();
        add_data_csums(&mut tree, &mut store, &cfg, 0, &sector_data(0, 4)).expect("add");
        add_data_csums(&mut tree, &mut store, &cfg, 0x1000, &sector_data(1, 4)).expect("add");

        delete_csum_range(&mut tree, &mut store, &cfg, 0, 4 * u64::from(SECTOR)).expect("delete");

        let csums = collect_csums(&mut tree, &store, &cfg);
        assert_eq!(csums.len(), 4);
        assert!(csums.keys().all(|s| *s >= 0x1000));
    }

    #[test]
    fn delete_middle_bisects_item() {
        let (mut store, mut tree, cfg) = setup();
        let data = sector_data(0, 10);
        add_data_csums(&mut tree, &mut store, &cfg, 0, &data).expect("add");

        // Drop sectors 3..7, keeping 0..3 and 7..10.
        let sector = u64::from(SECTOR);
        delete_csum_range(&mut tree, &mut store, &cfg, 3 * sector, 4 * sector).expect("delete");

        let csums = collect_csums(&mut tree, &store, &cfg);
        let live: Vec<u64> = csums.keys().copied().collect();
        let expected: Vec<u64> = (0..3).chain(7..10).map(|i| i * sector).collect();
        assert_eq!(live, expected);
        for i in (0..3).chain(7..10) {
            let chunk = &data[(i as usize) * SECTOR as usize..][..SECTOR as usize];
            assert_eq!(csums[&(i * sector)], expected_csum(chunk, &cfg));
        }

        // Two items now: head keyed at 0, tail rekeyed to the range end.
        let (head, exact) = tree.search(&store, Key::csum(0)).expect("search");
        assert!(exact);
        assert_eq!(
            tree.leaf(&head).expect("leaf").item_size(head.leaf_slot()).expect("size") as usize,
            3 * cfg.csum_size
        );
        let (tail, exact) = tree.search(&store, Key::csum(7 * sector)).expect("search");
        assert!(exact);
        assert_eq!(
            tree.leaf(&tail).expect("leaf").item_size(tail.leaf_slot()).expect("size") as usize,
            3 * cfg.csum_size
        );
    }

    #[test]
    fn delete_edges_truncates_neighbors() {
        let (mut store, mut tree, cfg) = setup();
        let sector = u64::from(SECTOR);
        add_data_csums(&mut tree, &mut store, &cfg, 0, &sector_data(0, 4)).expect("add");
        add_data_csums(&mut tree, &mut store, &cfg, 0x1000, &sector_data(1, 4)).expect("add");

        // Range covers the tail of the first item and the head of the
        // second.
        delete_csum_range(&mut tree, &mut store, &cfg, 2 * sector, 0x1000).expect("delete");

        let csums = collect_csums(&mut tree, &store, &cfg);
        let live: Vec<u64> = csums.keys().copied().collect();
        assert_eq!(live, vec![0, sector, 0x1000 + 2 * sector, 0x1000 + 3 * sector]);
    }

    #[test]
    fn insert_delete_replay_matches_model() {
        let (mut store, mut tree, cfg) = setup();
        let sector = u64::from(SECTOR);
        let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        // Interleave additions and removals over a few hundred sectors.
        for round in 0_u64..40 {
            let base = (round * 13 % 97) * sector;
            let sectors = (round % 7 + 1) as usize;
            let data = sector_data(round, sectors);
            add_data_csums(&mut tree, &mut store, &cfg, base, &data).expect("add");
            for (i, chunk) in data.chunks(SECTOR as usize).enumerate() {
                model.insert(base + i as u64 * sector, expected_csum(chunk, &cfg));
            }
            if round % 3 == 0 {
                let del_base = (round * 7 % 89) * sector;
                let del_len = (round % 5 + 1) * sector;
                delete_csum_range(&mut tree, &mut store, &cfg, del_base, del_len).expect("delete");
                for s in (del_base..del_base + del_len).step_by(SECTOR as usize) {
                    model.remove(&s);
                }
            }
        }

        let csums = collect_csums(&mut tree, &store, &cfg);
        assert_eq!(csums, model);
    }

    #[test]
    fn unaligned_ranges_are_rejected() {
        let (mut store, mut tree, cfg) = setup();
        let err = add_data_csums(&mut tree, &mut store, &cfg, 1, &sector_data(0, 1)).unwrap_err();
        assert!(matches!(err, BtrError::InvalidArgument(_)));
        let err = delete_csum_range(&mut tree, &mut store, &cfg, 0, 3).unwrap_err();
        assert!(matches!(err, BtrError::InvalidArgument(_)));
    }
}

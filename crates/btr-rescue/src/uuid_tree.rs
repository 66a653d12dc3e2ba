//! UUID tree removal.
//!
//! A damaged uuid tree is cheap to drop: the kernel rebuilds it on the next
//! mount once `uuid_tree_generation` no longer matches. The flow empties the
//! tree, deletes its root item from the root tree, and zeroes the generation
//! stamp in every superblock copy.

use crate::open::{ChunkMappedStore, find_root_item, open_filesystem};
use crate::super_edit::edit_super_copies;
use btr_block::ByteDevice;
use btr_error::{BtrError, Result};
use btr_tree::Tree;
use btr_types::{Key, ROOT_ITEM_KEY, UUID_TREE_OBJECTID};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearUuidTreeStatus {
    Cleared,
    AlreadyClear,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearUuidTreeReport {
    pub status: ClearUuidTreeStatus,
    pub items_deleted: usize,
    pub copies_updated: usize,
}

impl ClearUuidTreeReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Empty the uuid tree and delete its root item, mutating both trees in
/// memory only. Returns the number of uuid items deleted.
fn stage_clear<D: ByteDevice>(
    uuid_tree: &mut Tree,
    root_tree: &mut Tree,
    store: &ChunkMappedStore<'_, D>,
) -> Result<usize> {
    let mut items_deleted = 0_usize;
    loop {
        let path = uuid_tree.first_leaf(store)?;
        let nritems = uuid_tree.leaf(&path)?.nritems();
        if nritems == 0 {
            break;
        }
        uuid_tree.delete_items(store, &path, nritems)?;
        items_deleted += nritems;
    }

    let (path, exact) = root_tree.search(store, Key::new(UUID_TREE_OBJECTID, ROOT_ITEM_KEY, 0))?;
    if !exact {
        return Err(BtrError::CorruptBlock {
            bytenr: path.leaf_bytenr(),
            detail: "uuid tree root item vanished mid-flow".to_owned(),
        });
    }
    root_tree.delete_items(store, &path, 1)?;
    Ok(items_deleted)
}

pub fn clear_uuid_tree<D: ByteDevice>(device: &D) -> Result<ClearUuidTreeReport> {
    let info = open_filesystem(device)?;
    let sb = info.superblock;
    let mut store = ChunkMappedStore::new(device, info.chunk_map, sb.nodesize as usize);

    let Some(uuid_root) = find_root_item(&store, sb.root, UUID_TREE_OBJECTID)? else {
        return Ok(ClearUuidTreeReport {
            status: ClearUuidTreeStatus::AlreadyClear,
            items_deleted: 0,
            copies_updated: 0,
        });
    };

    let mut uuid_tree = Tree::open(&store, uuid_root.bytenr)?;
    let mut root_tree = Tree::open(&store, sb.root)?;

    // Stage every mutation on both trees in memory before the first write,
    // so a staging error leaves the device untouched.
    let items_deleted = match stage_clear(&mut uuid_tree, &mut root_tree, &store) {
        Ok(deleted) => deleted,
        Err(err) => {
            uuid_tree.abort();
            root_tree.abort();
            return Err(err);
        }
    };

    // Root tree first: an interrupted run then drops the reference before
    // the uuid tree itself, never stranding an emptied tree that is still
    // referenced from the root tree.
    root_tree.commit(&mut store, sb.generation)?;
    uuid_tree.commit(&mut store, sb.generation)?;

    let copies_updated = edit_super_copies(device, |copy| {
        copy.uuid_tree_generation = 0;
    })?;
    info!(items_deleted, copies_updated, "uuid tree cleared");
    Ok(ClearUuidTreeReport {
        status: ClearUuidTreeStatus::Cleared,
        items_deleted,
        copies_updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open::load_superblock;
    use crate::testimg::{self, ImageSpec, TestImage};
    use btr_block::MemByteDevice;
    use btr_types::CSUM_TREE_OBJECTID;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device that accepts a fixed number of writes and then fails every
    /// later one, while reads keep working.
    struct WriteBudgetDevice {
        inner: MemByteDevice,
        writes_left: AtomicUsize,
    }

    impl WriteBudgetDevice {
        fn new(inner: MemByteDevice, budget: usize) -> Self {
            Self {
                inner,
                writes_left: AtomicUsize::new(budget),
            }
        }
    }

    impl ByteDevice for WriteBudgetDevice {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_exact_at(offset, buf)
        }

        fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            let granted = self
                .writes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(BtrError::Io(std::io::Error::other("device write failed")));
            }
            self.inner.write_all_at(offset, buf)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn clear_drops_items_root_item_and_generation() {
        let TestImage { device, superblock } = testimg::build(ImageSpec {
            uuid_items: 4,
            ..ImageSpec::default()
        });

        let report = clear_uuid_tree(&device).expect("clear");
        assert_eq!(report.status, ClearUuidTreeStatus::Cleared);
        assert_eq!(report.items_deleted, 4);
        assert_eq!(report.copies_updated, 1);

        let info = open_filesystem(&device).expect("reopen");
        let store =
            ChunkMappedStore::new(&device, info.chunk_map, superblock.nodesize as usize);

        let gone = find_root_item(&store, superblock.root, UUID_TREE_OBJECTID).expect("lookup");
        assert!(gone.is_none(), "uuid tree root item must be deleted");

        // Other trees keep their root items.
        let csum_root = find_root_item(&store, superblock.root, CSUM_TREE_OBJECTID)
            .expect("lookup")
            .expect("csum tree intact");
        assert_eq!(csum_root.bytenr, testimg::CSUM_TREE_BYTENR);

        let sb = load_superblock(&device).expect("reload");
        assert_eq!(sb.uuid_tree_generation, 0);
    }

    #[test]
    fn exhausted_device_is_left_untouched() {
        let TestImage { device, .. } = testimg::build_small();
        let before = device.contents();

        let limited = WriteBudgetDevice::new(device.clone(), 0);
        clear_uuid_tree(&limited).expect_err("first write must fail");
        assert_eq!(device.contents(), before, "failed clear must not write");

        // The unrestricted device still clears cleanly afterwards.
        let report = clear_uuid_tree(&device).expect("retry");
        assert_eq!(report.status, ClearUuidTreeStatus::Cleared);
        assert_eq!(report.items_deleted, 2);
    }

    #[test]
    fn interrupted_commit_never_strands_an_emptied_uuid_tree() {
        let TestImage { device, superblock } = testimg::build_small();

        // One write lands and the next fails mid-commit.
        let limited = WriteBudgetDevice::new(device.clone(), 1);
        clear_uuid_tree(&limited).expect_err("commit must be interrupted");

        // The root item went first, so the uuid leaf on disk still holds
        // every item instead of sitting emptied behind a live reference.
        let info = open_filesystem(&device).expect("reopen");
        let store =
            ChunkMappedStore::new(&device, info.chunk_map, superblock.nodesize as usize);
        let gone = find_root_item(&store, superblock.root, UUID_TREE_OBJECTID).expect("lookup");
        assert!(gone.is_none(), "root item must not outlive the tree");

        let mut uuid_tree = Tree::open(&store, testimg::UUID_TREE_BYTENR).expect("open");
        let path = uuid_tree.first_leaf(&store).expect("leaf");
        assert_eq!(uuid_tree.leaf(&path).expect("leaf").nritems(), 2);

        // A rerun converges instead of erroring on the half-done state.
        let report = clear_uuid_tree(&device).expect("rerun");
        assert_eq!(report.status, ClearUuidTreeStatus::AlreadyClear);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let TestImage { device, .. } = testimg::build_small();
        clear_uuid_tree(&device).expect("first");
        let before = device.contents();
        let report = clear_uuid_tree(&device).expect("second");
        assert_eq!(report.status, ClearUuidTreeStatus::AlreadyClear);
        assert_eq!(device.contents(), before);
    }
}

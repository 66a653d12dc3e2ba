//! Tree-level operations: search, insert with node splitting, delete with
//! empty-block collapse, ordered leaf iteration, and the commit/abort cycle.
//!
//! Blocks are mutated in place in an in-memory arena and written back only
//! on [`Tree::commit`], which stamps the transaction generation and the
//! block checksum. [`Tree::abort`] discards every dirty block, so a failed
//! multi-step mutation leaves the on-disk tree untouched.

use crate::block::TreeBlock;
use crate::store::BlockStore;
use btr_error::{BtrError, Result};
use btr_types::{HEADER_SIZE, Key, LEAF_ITEM_SIZE};
use std::collections::{BTreeSet, HashMap};

/// A root-to-leaf descent: one (bytenr, slot) pair per level, index 0 being
/// the leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreePath {
    pub nodes: Vec<u64>,
    pub slots: Vec<usize>,
}

impl TreePath {
    #[must_use]
    pub fn leaf_bytenr(&self) -> u64 {
        self.nodes[0]
    }

    #[must_use]
    pub fn leaf_slot(&self) -> usize {
        self.slots[0]
    }
}

#[derive(Debug)]
pub struct Tree {
    owner: u64,
    fsid: [u8; 16],
    chunk_tree_uuid: [u8; 16],
    root_bytenr: u64,
    root_level: u8,
    committed_root: (u64, u8),
    arena: HashMap<u64, TreeBlock>,
    dirty: BTreeSet<u64>,
}

impl Tree {
    /// Create a tree with a fresh empty leaf as its root.
    pub fn create_empty<S: BlockStore>(
        store: &mut S,
        owner: u64,
        generation: u64,
        fsid: [u8; 16],
        chunk_tree_uuid: [u8; 16],
    ) -> Result<Self> {
        let root_bytenr = store.reserve_block()?;
        let root = TreeBlock::new_empty(
            root_bytenr,
            store.block_size(),
            0,
            owner,
            generation,
            fsid,
            chunk_tree_uuid,
        )?;
        let mut tree = Self {
            owner,
            fsid,
            chunk_tree_uuid,
            root_bytenr,
            root_level: 0,
            committed_root: (root_bytenr, 0),
            arena: HashMap::new(),
            dirty: BTreeSet::new(),
        };
        tree.arena.insert(root_bytenr, root);
        tree.dirty.insert(root_bytenr);
        Ok(tree)
    }

    /// Open an existing tree from its root block.
    pub fn open<S: BlockStore>(store: &S, root_bytenr: u64) -> Result<Self> {
        let root = read_tree_block(store, root_bytenr)?;
        let header = root.header()?;
        let mut tree = Self {
            owner: header.owner,
            fsid: header.fsid,
            chunk_tree_uuid: header.chunk_tree_uuid,
            root_bytenr,
            root_level: header.level,
            committed_root: (root_bytenr, header.level),
            arena: HashMap::new(),
            dirty: BTreeSet::new(),
        };
        tree.arena.insert(root_bytenr, root);
        Ok(tree)
    }

    #[must_use]
    pub fn root_bytenr(&self) -> u64 {
        self.root_bytenr
    }

    #[must_use]
    pub fn root_level(&self) -> u8 {
        self.root_level
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    #[must_use]
    pub fn has_dirty_blocks(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn load<S: BlockStore>(&mut self, store: &S, bytenr: u64) -> Result<()> {
        if !self.arena.contains_key(&bytenr) {
            let block = read_tree_block(store, bytenr)?;
            self.arena.insert(bytenr, block);
        }
        Ok(())
    }

    fn block(&self, bytenr: u64) -> Result<&TreeBlock> {
        self.arena
            .get(&bytenr)
            .ok_or_else(|| BtrError::NotFound(format!("block {bytenr} not loaded")))
    }

    fn block_mut_dirty(&mut self, bytenr: u64) -> Result<&mut TreeBlock> {
        self.dirty.insert(bytenr);
        self.arena
            .get_mut(&bytenr)
            .ok_or_else(|| BtrError::NotFound(format!("block {bytenr} not loaded")))
    }

    /// Leaf block of a path.
    pub fn leaf(&self, path: &TreePath) -> Result<&TreeBlock> {
        self.block(path.leaf_bytenr())
    }

    /// Mutable leaf block of a path; marks it dirty.
    pub fn leaf_mut(&mut self, path: &TreePath) -> Result<&mut TreeBlock> {
        self.block_mut_dirty(path.leaf_bytenr())
    }

    /// Descend from the root to the leaf that owns `key`.
    ///
    /// Returns the path and whether the leaf holds the key exactly; on a
    /// miss the leaf slot is the insertion point.
    pub fn search<S: BlockStore>(&mut self, store: &S, key: Key) -> Result<(TreePath, bool)> {
        let levels = usize::from(self.root_level) + 1;
        let mut nodes = vec![0_u64; levels];
        let mut slots = vec![0_usize; levels];
        let mut bytenr = self.root_bytenr;

        for level in (0..levels).rev() {
            self.load(store, bytenr)?;
            let block = self.block(bytenr)?;
            if usize::from(block.level()) != level {
                return Err(BtrError::CorruptBlock {
                    bytenr,
                    detail: format!("expected level {level}, found {}", block.level()),
                });
            }
            let (mut slot, exact) = block.search(key)?;
            if level > 0 {
                if !exact && slot > 0 {
                    slot -= 1;
                }
                nodes[level] = bytenr;
                slots[level] = slot;
                bytenr = block.node_blockptr(slot)?;
            } else {
                nodes[0] = bytenr;
                slots[0] = slot;
                return Ok((TreePath { nodes, slots }, exact));
            }
        }
        unreachable!("descent always terminates at level 0")
    }

    /// Insert a zero-filled item of `size` bytes under `key`, splitting
    /// blocks and growing the root as needed.
    pub fn insert_empty_item<S: BlockStore>(
        &mut self,
        store: &mut S,
        key: Key,
        size: usize,
    ) -> Result<TreePath> {
        let max_payload = store.block_size() - HEADER_SIZE - LEAF_ITEM_SIZE;
        if size > max_payload {
            return Err(BtrError::NoSpace);
        }
        let needed = size + LEAF_ITEM_SIZE;

        // A full node root must be split before anything hangs off it;
        // growing first guarantees every split target has a parent with room.
        self.load(store, self.root_bytenr)?;
        {
            let root = self.block(self.root_bytenr)?;
            if !root.is_leaf() && root.nritems() == root.node_capacity() {
                self.grow_root(store)?;
            }
        }

        let levels = usize::from(self.root_level) + 1;
        let mut nodes = vec![0_u64; levels];
        let mut slots = vec![0_usize; levels];
        let mut bytenr = self.root_bytenr;

        for level in (1..levels).rev() {
            self.load(store, bytenr)?;
            let block = self.block(bytenr)?;
            let (mut slot, exact) = block.search(key)?;
            if !exact && slot > 0 {
                slot -= 1;
            }
            nodes[level] = bytenr;
            slots[level] = slot;

            let mut child = self.block(bytenr)?.node_blockptr(slot)?;
            self.load(store, child)?;
            let child_block = self.block(child)?;
            if usize::from(child_block.level()) != level - 1 {
                return Err(BtrError::CorruptBlock {
                    bytenr: child,
                    detail: format!(
                        "expected level {}, found {}",
                        level - 1,
                        child_block.level()
                    ),
                });
            }
            // Pre-split full interior children on the way down.
            if child_block.level() > 0 && child_block.nritems() == child_block.node_capacity() {
                let (target, went_right) = self.split_node(store, bytenr, slot, child, key)?;
                if went_right {
                    slots[level] += 1;
                }
                child = target;
            }
            bytenr = child;
        }

        nodes[0] = bytenr;
        let (slot, exact) = self.block(bytenr)?.search(key)?;
        if exact {
            return Err(BtrError::InvalidArgument(format!(
                "key {key} already exists"
            )));
        }
        slots[0] = slot;

        if self.block(bytenr)?.free_space()? < needed {
            if self.root_level == 0 {
                self.grow_root(store)?;
                return self.insert_empty_item(store, key, size);
            }
            let (target, went_right) = self.split_leaf(store, nodes[1], slots[1], bytenr, key)?;
            if went_right {
                slots[1] += 1;
            }
            nodes[0] = target;
            let (new_slot, _) = self.block(target)?.search(key)?;
            slots[0] = new_slot;
            if self.block(target)?.free_space()? < needed {
                return Err(BtrError::NoSpace);
            }
        }

        let path = TreePath { nodes, slots };
        let slot = path.slots[0];
        self.leaf_mut(&path)?.insert_item(slot, key, size)?;
        if slot == 0 {
            self.fixup_low_keys(&path, key, 1)?;
        }
        Ok(path)
    }

    /// Insert an item carrying `data`.
    pub fn insert_item<S: BlockStore>(
        &mut self,
        store: &mut S,
        key: Key,
        data: &[u8],
    ) -> Result<TreePath> {
        let path = self.insert_empty_item(store, key, data.len())?;
        let slot = path.slots[0];
        self.leaf_mut(&path)?.item_data_mut(slot)?.copy_from_slice(data);
        Ok(path)
    }

    /// Replace a pushed-down first key in the ancestors of `path`, starting
    /// at `start_level`.
    fn fixup_low_keys(&mut self, path: &TreePath, key: Key, start_level: usize) -> Result<()> {
        for level in start_level..path.nodes.len() {
            let slot = path.slots[level];
            self.block_mut_dirty(path.nodes[level])?.set_key(slot, key)?;
            if slot != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Rewrite the key of the item at `path`, propagating a slot-0 change
    /// upward. The new key must preserve leaf ordering.
    pub fn set_item_key_safe(&mut self, path: &TreePath, new_key: Key) -> Result<()> {
        let slot = path.leaf_slot();
        {
            let leaf = self.leaf(path)?;
            if slot > 0 && leaf.key(slot - 1)? >= new_key {
                return Err(BtrError::InvalidArgument(format!(
                    "new key {new_key} not greater than left neighbor"
                )));
            }
            if slot + 1 < leaf.nritems() && leaf.key(slot + 1)? <= new_key {
                return Err(BtrError::InvalidArgument(format!(
                    "new key {new_key} not less than right neighbor"
                )));
            }
        }
        self.leaf_mut(path)?.set_key(slot, new_key)?;
        if slot == 0 {
            self.fixup_low_keys(path, new_key, 1)?;
        }
        Ok(())
    }

    /// Push the current root down one level under a new node root.
    fn grow_root<S: BlockStore>(&mut self, store: &mut S) -> Result<()> {
        let old_root = self.root_bytenr;
        self.load(store, old_root)?;
        let (first_key, generation) = {
            let root = self.block(old_root)?;
            let key = if root.nritems() == 0 {
                Key::default()
            } else {
                root.key(0)?
            };
            (key, root.generation())
        };

        let new_bytenr = store.reserve_block()?;
        let mut new_root = TreeBlock::new_empty(
            new_bytenr,
            store.block_size(),
            self.root_level + 1,
            self.owner,
            generation,
            self.fsid,
            self.chunk_tree_uuid,
        )?;
        new_root.insert_ptr(0, first_key, old_root, generation)?;
        self.arena.insert(new_bytenr, new_root);
        self.dirty.insert(new_bytenr);
        self.root_bytenr = new_bytenr;
        self.root_level += 1;
        Ok(())
    }

    /// Split the leaf under `parent[parent_slot]` in half. Returns the leaf
    /// that should receive `key` and whether that is the new right sibling.
    fn split_leaf<S: BlockStore>(
        &mut self,
        store: &mut S,
        parent: u64,
        parent_slot: usize,
        leaf: u64,
        key: Key,
    ) -> Result<(u64, bool)> {
        let nritems = self.block(leaf)?.nritems();
        if nritems < 2 {
            return Err(BtrError::NoSpace);
        }
        let mid = nritems / 2;

        let right_bytenr = store.reserve_block()?;
        let generation = self.block(leaf)?.generation();
        let mut right = TreeBlock::new_empty(
            right_bytenr,
            store.block_size(),
            0,
            self.owner,
            generation,
            self.fsid,
            self.chunk_tree_uuid,
        )?;
        for i in mid..nritems {
            let left = self.block(leaf)?;
            let item_key = left.key(i)?;
            let data = left.item_data(i)?.to_vec();
            right.insert_item_with(i - mid, item_key, &data)?;
        }
        let right_key = right.key(0)?;
        self.arena.insert(right_bytenr, right);
        self.dirty.insert(right_bytenr);

        self.block_mut_dirty(leaf)?.remove_items(mid, nritems - mid)?;
        self.block_mut_dirty(parent)?
            .insert_ptr(parent_slot + 1, right_key, right_bytenr, generation)?;

        if key >= right_key {
            Ok((right_bytenr, true))
        } else {
            Ok((leaf, false))
        }
    }

    /// Split a full interior node, inserting the new sibling pointer into
    /// its parent (which the descent guarantees has room).
    fn split_node<S: BlockStore>(
        &mut self,
        store: &mut S,
        parent: u64,
        parent_slot: usize,
        node: u64,
        key: Key,
    ) -> Result<(u64, bool)> {
        let nritems = self.block(node)?.nritems();
        let mid = nritems / 2;
        let level = self.block(node)?.level();
        let generation = self.block(node)?.generation();

        let right_bytenr = store.reserve_block()?;
        let mut right = TreeBlock::new_empty(
            right_bytenr,
            store.block_size(),
            level,
            self.owner,
            generation,
            self.fsid,
            self.chunk_tree_uuid,
        )?;
        for i in mid..nritems {
            let left = self.block(node)?;
            let ptr_key = left.key(i)?;
            let blockptr = left.node_blockptr(i)?;
            let ptr_gen = left.node_ptr_generation(i)?;
            right.insert_ptr(i - mid, ptr_key, blockptr, ptr_gen)?;
        }
        let right_key = right.key(0)?;
        self.arena.insert(right_bytenr, right);
        self.dirty.insert(right_bytenr);

        {
            let left = self.block_mut_dirty(node)?;
            for i in (mid..nritems).rev() {
                left.remove_ptr(i)?;
            }
        }
        self.block_mut_dirty(parent)?
            .insert_ptr(parent_slot + 1, right_key, right_bytenr, generation)?;

        if key >= right_key {
            Ok((right_bytenr, true))
        } else {
            Ok((node, false))
        }
    }

    /// Make room in the leaf at `path` by splitting it (growing the root
    /// first when the leaf is the root). The caller's path is stale
    /// afterwards and must be re-searched.
    pub(crate) fn make_leaf_room<S: BlockStore>(
        &mut self,
        store: &mut S,
        path: &TreePath,
    ) -> Result<()> {
        let leaf = path.leaf_bytenr();
        let pivot = {
            let block = self.block(leaf)?;
            block.key(block.nritems() / 2)?
        };
        if path.nodes.len() == 1 {
            self.grow_root(store)?;
            let root = self.root_bytenr;
            self.split_leaf(store, root, 0, leaf, pivot)?;
            return Ok(());
        }
        self.split_leaf_with_reserve(store, path.nodes[1], path.slots[1], leaf, pivot)
    }

    fn split_leaf_with_reserve<S: BlockStore>(
        &mut self,
        store: &mut S,
        parent: u64,
        parent_slot: usize,
        leaf: u64,
        key: Key,
    ) -> Result<()> {
        // The parent may be full here since this split is not part of a
        // top-down descent; grow through it if needed.
        let parent_block = self.block(parent)?;
        if parent_block.nritems() == parent_block.node_capacity() {
            return Err(BtrError::NoSpace);
        }
        self.split_leaf(store, parent, parent_slot, leaf, key)?;
        Ok(())
    }

    /// Delete `count` items at the path's leaf slot. An emptied leaf is
    /// unlinked from its parent, and an emptied ancestor chain collapses
    /// the root.
    pub fn delete_items<S: BlockStore>(
        &mut self,
        _store: &S,
        path: &TreePath,
        count: usize,
    ) -> Result<()> {
        let slot = path.leaf_slot();
        let leaf_bytenr = path.leaf_bytenr();
        self.leaf_mut(path)?.remove_items(slot, count)?;

        if self.leaf(path)?.nritems() == 0 {
            if path.nodes.len() == 1 {
                // Empty root leaf is a valid empty tree.
                return Ok(());
            }
            self.del_ptr(path, 1)?;
            self.arena.remove(&leaf_bytenr);
            self.dirty.remove(&leaf_bytenr);
        } else if slot == 0 {
            let new_first = self.leaf(path)?.key(0)?;
            self.fixup_low_keys(path, new_first, 1)?;
        }
        Ok(())
    }

    fn del_ptr(&mut self, path: &TreePath, level: usize) -> Result<()> {
        let bytenr = path.nodes[level];
        let slot = path.slots[level];
        self.block_mut_dirty(bytenr)?.remove_ptr(slot)?;

        let is_root = level == path.nodes.len() - 1;
        let nritems = self.block(bytenr)?.nritems();

        if is_root {
            self.collapse_root()?;
            return Ok(());
        }
        if nritems == 0 {
            self.del_ptr(path, level + 1)?;
            self.arena.remove(&bytenr);
            self.dirty.remove(&bytenr);
        } else if slot == 0 {
            let new_first = self.block(bytenr)?.key(0)?;
            self.fixup_low_keys(path, new_first, level + 1)?;
        }
        Ok(())
    }

    /// While the root is a node with a single child, make the child the
    /// root.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root = self.block(self.root_bytenr)?;
            if root.is_leaf() || root.nritems() != 1 {
                return Ok(());
            }
            let child = root.node_blockptr(0)?;
            let old_root = self.root_bytenr;
            self.root_bytenr = child;
            self.root_level -= 1;
            self.arena.remove(&old_root);
            self.dirty.remove(&old_root);
            // Child must already be in the arena to keep collapsing; if it
            // is not loaded, stop here and let the next search pick it up.
            if !self.arena.contains_key(&child) {
                return Ok(());
            }
        }
    }

    /// Path to the leftmost leaf, slot 0.
    pub fn first_leaf<S: BlockStore>(&mut self, store: &S) -> Result<TreePath> {
        let (mut path, _) = self.search(store, Key::default())?;
        path.slots[0] = 0;
        Ok(path)
    }

    /// Advance `path` to the first slot of the next leaf, or `None` at the
    /// end of the tree.
    pub fn next_leaf<S: BlockStore>(
        &mut self,
        store: &S,
        path: &TreePath,
    ) -> Result<Option<TreePath>> {
        let mut pivot = None;
        for level in 1..path.nodes.len() {
            self.load(store, path.nodes[level])?;
            if path.slots[level] + 1 < self.block(path.nodes[level])?.nritems() {
                pivot = Some(level);
                break;
            }
        }
        let Some(pivot) = pivot else {
            return Ok(None);
        };

        let mut next = path.clone();
        next.slots[pivot] += 1;
        for level in (0..pivot).rev() {
            let parent = next.nodes[level + 1];
            let bytenr = self.block(parent)?.node_blockptr(next.slots[level + 1])?;
            self.load(store, bytenr)?;
            let block = self.block(bytenr)?;
            if usize::from(block.level()) != level {
                return Err(BtrError::CorruptBlock {
                    bytenr,
                    detail: format!("expected level {level}, found {}", block.level()),
                });
            }
            next.nodes[level] = bytenr;
            next.slots[level] = 0;
        }
        Ok(Some(next))
    }

    /// Write every dirty block back, stamped with `transid` and a fresh
    /// checksum, then flush the store.
    pub fn commit<S: BlockStore>(&mut self, store: &mut S, transid: u64) -> Result<()> {
        let dirty: Vec<u64> = self.dirty.iter().copied().collect();
        for bytenr in dirty {
            let block = self
                .arena
                .get_mut(&bytenr)
                .ok_or_else(|| BtrError::NotFound(format!("dirty block {bytenr} not loaded")))?;
            block.set_generation(transid);
            block.stamp_csum()?;
            store.write_block(bytenr, block.buf())?;
        }
        store.flush()?;
        self.dirty.clear();
        self.committed_root = (self.root_bytenr, self.root_level);
        Ok(())
    }

    /// Drop every dirty block and restore the last committed root. The
    /// store is left exactly as the previous commit wrote it.
    pub fn abort(&mut self) {
        let dirty: Vec<u64> = std::mem::take(&mut self.dirty).into_iter().collect();
        for bytenr in dirty {
            self.arena.remove(&bytenr);
        }
        let (bytenr, level) = self.committed_root;
        self.root_bytenr = bytenr;
        self.root_level = level;
    }
}

/// Read and validate a tree block from a store.
pub fn read_tree_block<S: BlockStore>(store: &S, bytenr: u64) -> Result<TreeBlock> {
    let raw = store.read_block(bytenr)?;
    TreeBlock::from_bytes(bytenr, raw, true)
}

//! Whole-tree traversal for inspection and dump tooling.
//!
//! Both orders visit each reachable block exactly once. A child that fails
//! to read, fails checksum validation, or sits at the wrong level is logged
//! and skipped; the walk continues with the remaining siblings so one bad
//! block does not hide the rest of the tree.

use crate::block::TreeBlock;
use crate::store::BlockStore;
use crate::tree::read_tree_block;
use btr_error::Result;
use serde::Serialize;
use tracing::warn;

/// Counters accumulated over one traversal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    /// Every block visited, leaves included.
    pub blocks_visited: u64,
    pub leaves_visited: u64,
    /// Children skipped because they were unreadable or inconsistent.
    pub corrupt_children: u64,
}

/// Pre-order depth-first walk from `root_bytenr`.
pub fn walk_dfs<S, F>(store: &S, root_bytenr: u64, visit: &mut F) -> Result<WalkReport>
where
    S: BlockStore,
    F: FnMut(&TreeBlock) -> Result<()>,
{
    let root = read_tree_block(store, root_bytenr)?;
    let mut report = WalkReport::default();
    dfs_block(store, &root, visit, &mut report)?;
    Ok(report)
}

fn dfs_block<S, F>(
    store: &S,
    block: &TreeBlock,
    visit: &mut F,
    report: &mut WalkReport,
) -> Result<()>
where
    S: BlockStore,
    F: FnMut(&TreeBlock) -> Result<()>,
{
    report.blocks_visited += 1;
    if block.is_leaf() {
        report.leaves_visited += 1;
    }
    visit(block)?;
    if block.is_leaf() {
        return Ok(());
    }
    for slot in 0..block.nritems() {
        match load_child(store, block, slot) {
            Some(child) => dfs_block(store, &child, visit, report)?,
            None => report.corrupt_children += 1,
        }
    }
    Ok(())
}

/// Breadth-first walk from `root_bytenr`: each level fully visited, left to
/// right, before its children.
pub fn walk_bfs<S, F>(store: &S, root_bytenr: u64, visit: &mut F) -> Result<WalkReport>
where
    S: BlockStore,
    F: FnMut(&TreeBlock) -> Result<()>,
{
    let root = read_tree_block(store, root_bytenr)?;
    let mut report = WalkReport::default();
    let mut level = vec![root];

    while !level.is_empty() {
        let mut next = Vec::new();
        for block in &level {
            report.blocks_visited += 1;
            if block.is_leaf() {
                report.leaves_visited += 1;
            }
            visit(block)?;
            if block.is_leaf() {
                continue;
            }
            for slot in 0..block.nritems() {
                match load_child(store, block, slot) {
                    Some(child) => next.push(child),
                    None => report.corrupt_children += 1,
                }
            }
        }
        level = next;
    }
    Ok(report)
}

/// Read one child pointer, logging and discarding anything inconsistent.
fn load_child<S: BlockStore>(store: &S, parent: &TreeBlock, slot: usize) -> Option<TreeBlock> {
    let bytenr = match parent.node_blockptr(slot) {
        Ok(bytenr) => bytenr,
        Err(err) => {
            warn!(parent = parent.bytenr(), slot, %err, "unreadable child pointer, skipping");
            return None;
        }
    };
    let child = match read_tree_block(store, bytenr) {
        Ok(child) => child,
        Err(err) => {
            warn!(parent = parent.bytenr(), slot, bytenr, %err, "unreadable child block, skipping");
            return None;
        }
    };
    if child.level() + 1 != parent.level() {
        warn!(
            parent = parent.bytenr(),
            slot,
            bytenr,
            child_level = child.level(),
            parent_level = parent.level(),
            "child level does not descend from parent, skipping"
        );
        return None;
    }
    Some(child)
}

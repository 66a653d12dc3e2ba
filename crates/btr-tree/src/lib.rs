//! In-memory model of on-disk b-trees: block-level item packing, tree
//! search and mutation with a commit/abort cycle, the data checksum
//! engine, and read-only traversal.

#![forbid(unsafe_code)]

pub mod block;
pub mod csum;
pub mod store;
pub mod tree;
pub mod walk;

pub use block::TreeBlock;
pub use csum::{
    CsumConfig, add_data_csums, delete_csum_range, lookup_csum, max_csum_entries, read_csum,
};
pub use store::{BlockStore, MemBlockStore};
pub use tree::{Tree, TreePath, read_tree_block};
pub use walk::{WalkReport, walk_bfs, walk_dfs};

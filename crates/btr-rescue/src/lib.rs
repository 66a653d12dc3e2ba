//! Offline rescue flows for damaged filesystems: superblock recovery,
//! chunk tree reconstruction, data checksum repair, and a handful of
//! direct superblock edits. Every flow reports a serializable outcome and
//! asks before rewriting anything irreversible.

#![forbid(unsafe_code)]

pub mod checksum;
pub mod chunk_recover;
pub mod mount;
pub mod open;
pub mod prompt;
pub mod super_edit;
pub mod super_recover;
pub mod uuid_tree;

#[cfg(test)]
pub(crate) mod testimg;

pub use checksum::{FixChecksumReport, RepairMode, fix_data_checksum};
pub use chunk_recover::{ChunkRecoveryReport, ChunkRecoveryStatus, chunk_recover};
pub use mount::ensure_not_mounted;
pub use open::{
    ChunkMappedStore, FsInfo, find_root_item, load_superblock, open_filesystem, super_copy_offsets,
};
pub use prompt::{AutoConfirm, Prompter, StdinPrompter};
pub use super_edit::{
    ClearSpaceCacheReport, ClearSpaceCacheStatus, FixDeviceSizeReport, FixDeviceSizeStatus,
    ZeroLogReport, ZeroLogStatus, clear_space_cache_v1, fix_device_size, zero_log,
};
pub use super_recover::{
    SuperCopyState, SuperRecoveryReport, SuperRecoveryStatus, super_recover,
};
pub use uuid_tree::{ClearUuidTreeReport, ClearUuidTreeStatus, clear_uuid_tree};

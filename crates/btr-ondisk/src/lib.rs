#![forbid(unsafe_code)]
//! On-disk structure codec.
//!
//! Bit-exact parsing and encoding of the structures rescue flows touch:
//! superblocks, tree block headers, chunk items with their stripe arrays,
//! device items, root items, and the typed leaf payload view used by dump
//! tooling. All parsing is bounds-checked and returns
//! `ParseError`; no function here performs I/O.

pub mod chunk;
pub mod header;
pub mod item;
pub mod payload;
pub mod super_block;

pub use chunk::{
    ChunkEntry, ChunkMap, PhysicalMapping, Stripe, encode_chunk_payload, encode_sys_chunk_array,
    parse_chunk_payload, parse_sys_chunk_array,
};
pub use header::{Header, block_csum_matches, compute_block_csum, stamp_block_csum};
pub use item::{DevItem, RootItem, read_key_at, write_key_at};
pub use payload::{
    DirEntry, ExtentData, ExtentItem, InodeItem, InodeRef, ItemPayload, decode_payload,
};
pub use super_block::{
    Superblock, compute_super_csum, stamp_super_csum, super_csum_matches,
};

//! Block storage abstraction for tree I/O.

use btr_error::{BtrError, Result};
use std::collections::HashMap;

/// Source and sink of whole tree blocks, addressed by logical bytenr.
///
/// Implementations translate logical addresses to device offsets; the tree
/// layer never sees physical geometry.
pub trait BlockStore {
    /// Tree block size in bytes (the filesystem nodesize).
    fn block_size(&self) -> usize;

    /// Read the full block at `bytenr`.
    fn read_block(&self, bytenr: u64) -> Result<Vec<u8>>;

    /// Write the full block at `bytenr`. `data.len()` MUST equal
    /// `block_size()`.
    fn write_block(&mut self, bytenr: u64, data: &[u8]) -> Result<()>;

    /// Reserve a fresh, unused bytenr for a new tree block.
    fn reserve_block(&mut self) -> Result<u64>;

    /// Flush pending writes to stable storage.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory block store.
///
/// Backs the tree engine test suites and the chunk tree rebuild, which
/// assembles new blocks in memory before writing them out.
#[derive(Debug, Clone)]
pub struct MemBlockStore {
    block_size: usize,
    blocks: HashMap<u64, Vec<u8>>,
    next_bytenr: u64,
}

impl MemBlockStore {
    /// `alloc_start` is the first bytenr handed out by `reserve_block`.
    #[must_use]
    pub fn new(block_size: usize, alloc_start: u64) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
            next_bytenr: alloc_start,
        }
    }

    /// Preload a block, e.g. when replaying an existing image.
    pub fn insert_block(&mut self, bytenr: u64, data: Vec<u8>) -> Result<()> {
        if data.len() != self.block_size {
            return Err(BtrError::InvalidArgument(format!(
                "block size mismatch: got {} expected {}",
                data.len(),
                self.block_size
            )));
        }
        self.blocks.insert(bytenr, data);
        Ok(())
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytenrs of all stored blocks, sorted.
    #[must_use]
    pub fn bytenrs(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.blocks.keys().copied().collect();
        out.sort_unstable();
        out
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, bytenr: u64) -> Result<Vec<u8>> {
        self.blocks
            .get(&bytenr)
            .cloned()
            .ok_or_else(|| BtrError::NotFound(format!("block at bytenr {bytenr}")))
    }

    fn write_block(&mut self, bytenr: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size {
            return Err(BtrError::InvalidArgument(format!(
                "block size mismatch: got {} expected {}",
                data.len(),
                self.block_size
            )));
        }
        self.blocks.insert(bytenr, data.to_vec());
        Ok(())
    }

    fn reserve_block(&mut self) -> Result<u64> {
        let bytenr = self.next_bytenr;
        self.next_bytenr = bytenr
            .checked_add(u64::try_from(self.block_size).map_err(|_| {
                BtrError::InvalidArgument("block_size overflows u64".to_owned())
            })?)
            .ok_or_else(|| BtrError::NoSpace)?;
        Ok(bytenr)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Filesystem open path.
//!
//! Opening an image proceeds superblock -> sys chunk array -> chunk tree ->
//! chunk map. The finished map backs [`ChunkMappedStore`], the
//! logical-addressed block store every tree operation runs against.

use btr_block::ByteDevice;
use btr_error::{BtrError, Result};
use btr_ondisk::{
    ChunkEntry, ChunkMap, RootItem, Superblock, parse_chunk_payload, parse_sys_chunk_array,
    super_csum_matches,
};
use btr_tree::{BlockStore, Tree, walk_dfs};
use btr_types::{
    CHUNK_ITEM_KEY, Key, ROOT_ITEM_KEY, SUPER_COPY_OFFSETS, SUPER_INFO_OFFSET, SUPER_INFO_SIZE,
};
use tracing::debug;

/// Superblock copy offsets that fit inside `device_len` bytes.
#[must_use]
pub fn super_copy_offsets(device_len: u64) -> Vec<u64> {
    SUPER_COPY_OFFSETS
        .iter()
        .copied()
        .filter(|offset| offset + SUPER_INFO_SIZE as u64 <= device_len)
        .collect()
}

/// Read one raw superblock region.
pub fn read_super_region<D: ByteDevice>(device: &D, offset: u64) -> Result<Vec<u8>> {
    let mut region = vec![0_u8; SUPER_INFO_SIZE];
    device.read_exact_at(offset, &mut region)?;
    Ok(region)
}

/// Load and validate the primary superblock.
pub fn load_superblock<D: ByteDevice>(device: &D) -> Result<Superblock> {
    let region = read_super_region(device, SUPER_INFO_OFFSET)?;
    if !super_csum_matches(&region) {
        return Err(BtrError::CorruptBlock {
            bytenr: SUPER_INFO_OFFSET,
            detail: "superblock checksum mismatch".to_owned(),
        });
    }
    Superblock::parse_region(&region).map_err(|err| BtrError::Parse(err.to_string()))
}

/// Block store over a raw device addressed by logical bytenr through a
/// chunk map. Has no allocator: rescue flows only rewrite blocks that
/// already exist.
pub struct ChunkMappedStore<'d, D: ByteDevice> {
    device: &'d D,
    map: ChunkMap,
    block_size: usize,
}

impl<'d, D: ByteDevice> ChunkMappedStore<'d, D> {
    pub fn new(device: &'d D, map: ChunkMap, block_size: usize) -> Self {
        Self {
            device,
            map,
            block_size,
        }
    }

    #[must_use]
    pub fn chunk_map(&self) -> &ChunkMap {
        &self.map
    }

    fn physical(&self, bytenr: u64) -> Result<u64> {
        match self
            .map
            .map(bytenr)
            .map_err(|err| BtrError::Parse(err.to_string()))?
        {
            Some(mapping) => Ok(mapping.physical),
            None => Err(BtrError::NotFound(format!(
                "logical bytenr {bytenr} not covered by any chunk"
            ))),
        }
    }
}

impl<D: ByteDevice> BlockStore for ChunkMappedStore<'_, D> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, bytenr: u64) -> Result<Vec<u8>> {
        let physical = self.physical(bytenr)?;
        let mut buf = vec![0_u8; self.block_size];
        self.device.read_exact_at(physical, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, bytenr: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size {
            return Err(BtrError::InvalidArgument(format!(
                "block size mismatch: got {} expected {}",
                data.len(),
                self.block_size
            )));
        }
        let physical = self.physical(bytenr)?;
        self.device.write_all_at(physical, data)
    }

    fn reserve_block(&mut self) -> Result<u64> {
        Err(BtrError::RescueFailed(
            "chunk-mapped store has no block allocator".to_owned(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        self.device.sync()
    }
}

/// Chunk map assembled from the superblock's sys chunk array alone. Enough
/// to read the chunk tree itself, which lives in system chunks.
pub fn bootstrap_chunk_map(superblock: &Superblock) -> Result<ChunkMap> {
    let entries = parse_sys_chunk_array(&superblock.sys_chunk_array)
        .map_err(|err| BtrError::Parse(err.to_string()))?;
    Ok(ChunkMap::new(entries))
}

/// Full chunk map: bootstrap through the sys array, then collect every
/// chunk item in the chunk tree.
pub fn build_chunk_map<D: ByteDevice>(device: &D, superblock: &Superblock) -> Result<ChunkMap> {
    let bootstrap = bootstrap_chunk_map(superblock)?;
    let store = ChunkMappedStore::new(device, bootstrap, superblock.nodesize as usize);

    let mut entries: Vec<ChunkEntry> = Vec::new();
    walk_dfs(&store, superblock.chunk_root, &mut |block| {
        if !block.is_leaf() {
            return Ok(());
        }
        for slot in 0..block.nritems() {
            let key = block.key(slot)?;
            if key.item_type != CHUNK_ITEM_KEY {
                continue;
            }
            let data = block.item_data(slot)?;
            let (entry, _) =
                parse_chunk_payload(data, 0, key.offset).map_err(|err| BtrError::CorruptBlock {
                    bytenr: block.bytenr(),
                    detail: err.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(())
    })?;
    debug!(chunks = entries.len(), "chunk map assembled");
    Ok(ChunkMap::new(entries))
}

/// Parsed superblock plus the chunk map needed for logical-addressed reads.
#[derive(Debug)]
pub struct FsInfo {
    pub superblock: Superblock,
    pub chunk_map: ChunkMap,
}

/// Open an image: primary superblock, then the full chunk map.
pub fn open_filesystem<D: ByteDevice>(device: &D) -> Result<FsInfo> {
    let superblock = load_superblock(device)?;
    let chunk_map = build_chunk_map(device, &superblock)?;
    Ok(FsInfo {
        superblock,
        chunk_map,
    })
}

/// Look up a tree's root item in the root tree by owner objectid.
pub fn find_root_item<S: BlockStore>(
    store: &S,
    root_tree_bytenr: u64,
    objectid: u64,
) -> Result<Option<RootItem>> {
    let mut tree = Tree::open(store, root_tree_bytenr)?;
    let (mut path, exact) = tree.search(store, Key::new(objectid, ROOT_ITEM_KEY, 0))?;
    if !exact && path.leaf_slot() >= tree.leaf(&path)?.nritems() {
        match tree.next_leaf(store, &path)? {
            Some(next) => path = next,
            None => return Ok(None),
        }
    }
    let leaf = tree.leaf(&path)?;
    let key = leaf.key(path.leaf_slot())?;
    if key.objectid != objectid || key.item_type != ROOT_ITEM_KEY {
        return Ok(None);
    }
    let item = RootItem::parse(leaf.item_data(path.leaf_slot())?).map_err(|err| {
        BtrError::CorruptBlock {
            bytenr: path.leaf_bytenr(),
            detail: err.to_string(),
        }
    })?;
    Ok(Some(item))
}

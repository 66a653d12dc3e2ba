//! Small synthetic filesystem images for rescue-flow tests.
//!
//! The image has three chunks (system, metadata, data), four single-leaf
//! trees (chunk, root, checksum, uuid), checksummed data sectors, and a
//! stamped primary superblock. Mirror-sized devices also carry the 64 MiB
//! superblock copy.

use btr_block::{ByteDevice, MemByteDevice};
use btr_ondisk::{
    ChunkEntry, DevItem, RootItem, Stripe, Superblock, encode_sys_chunk_array, stamp_super_csum,
};
use btr_tree::TreeBlock;
use btr_types::{
    BLOCK_GROUP_DATA, BLOCK_GROUP_METADATA, BLOCK_GROUP_SYSTEM, BTRFS_MAGIC, CHUNK_ITEM_KEY,
    CHUNK_TREE_OBJECTID, CSUM_TREE_OBJECTID, CSUM_TYPE_CRC32C, DEV_ITEMS_OBJECTID, DEV_ITEM_KEY,
    FIRST_CHUNK_TREE_OBJECTID, Key, ROOT_ITEM_KEY, ROOT_TREE_OBJECTID, SUPER_INFO_OFFSET,
    SUPER_INFO_SIZE, UUID_TREE_OBJECTID,
};

pub(crate) const BLOCK: usize = 4096;
pub(crate) const GENERATION: u64 = 7;
pub(crate) const FSID: [u8; 16] = [0x5A; 16];
pub(crate) const CHUNK_UUID: [u8; 16] = [0xC7; 16];

pub(crate) const SYS_LOGICAL: u64 = 0x100_0000;
pub(crate) const SYS_PHYSICAL: u64 = 0x10_0000;
pub(crate) const SYS_LEN: u64 = 0x40_0000;
pub(crate) const META_LOGICAL: u64 = 0x200_0000;
pub(crate) const META_PHYSICAL: u64 = 0x50_0000;
pub(crate) const META_LEN: u64 = 0x40_0000;
pub(crate) const DATA_LOGICAL: u64 = 0x400_0000;
pub(crate) const DATA_PHYSICAL: u64 = 0x90_0000;
pub(crate) const DATA_LEN: u64 = 0x40_0000;
/// Physical base of the second data stripe on mirrored-data images.
pub(crate) const DATA_PHYSICAL_MIRROR: u64 = 0xD0_0000;

pub(crate) const CHUNK_TREE_BYTENR: u64 = SYS_LOGICAL;
pub(crate) const ROOT_TREE_BYTENR: u64 = META_LOGICAL;
pub(crate) const CSUM_TREE_BYTENR: u64 = META_LOGICAL + 0x1000;
pub(crate) const UUID_TREE_BYTENR: u64 = META_LOGICAL + 0x2000;

/// Smallest device that holds all three chunks.
pub(crate) const SMALL_LEN: usize = 0xD0_0000;
/// Holds the second data stripe as well.
pub(crate) const TWO_STRIPE_LEN: usize = 0x110_0000;
/// Large enough for the 64 MiB superblock mirror.
pub(crate) const MIRROR_LEN: usize = 0x500_0000;

pub(crate) struct ImageSpec {
    pub device_len: usize,
    pub log_root: u64,
    pub data_sectors: usize,
    pub data_stripes: usize,
    pub uuid_items: usize,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            device_len: SMALL_LEN,
            log_root: 0,
            data_sectors: 4,
            data_stripes: 1,
            uuid_items: 2,
        }
    }
}

pub(crate) struct TestImage {
    pub device: MemByteDevice,
    pub superblock: Superblock,
}

/// Deterministic content of data sector `i`.
pub(crate) fn data_sector(i: usize) -> Vec<u8> {
    (0..BLOCK).map(|j| ((i * 131 + j) % 251) as u8).collect()
}

pub(crate) fn build_small() -> TestImage {
    build(ImageSpec::default())
}

pub(crate) fn meta_physical(logical: u64) -> u64 {
    META_PHYSICAL + (logical - META_LOGICAL)
}

pub(crate) fn chunk_entry(logical: u64, length: u64, physical: u64, chunk_type: u64) -> ChunkEntry {
    chunk_entry_striped(logical, length, &[physical], chunk_type)
}

pub(crate) fn chunk_entry_striped(
    logical: u64,
    length: u64,
    physicals: &[u64],
    chunk_type: u64,
) -> ChunkEntry {
    ChunkEntry {
        key: Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, logical),
        length,
        owner: 2,
        stripe_len: 64 * 1024,
        chunk_type,
        io_align: BLOCK as u32,
        io_width: BLOCK as u32,
        sector_size: BLOCK as u32,
        sub_stripes: 0,
        stripes: physicals
            .iter()
            .map(|&offset| Stripe {
                devid: 1,
                offset,
                dev_uuid: [0x0D; 16],
            })
            .collect(),
    }
}

fn dev_item(device_len: u64) -> DevItem {
    DevItem {
        devid: 1,
        total_bytes: device_len,
        bytes_used: SYS_LEN + META_LEN + DATA_LEN,
        io_align: BLOCK as u32,
        io_width: BLOCK as u32,
        sector_size: BLOCK as u32,
        dev_type: 0,
        generation: 0,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: [0x0D; 16],
        fsid: FSID,
    }
}

fn root_item_payload(bytenr: u64) -> Vec<u8> {
    let item = RootItem {
        generation: GENERATION,
        root_dirid: 256,
        bytenr,
        byte_limit: 0,
        bytes_used: BLOCK as u64,
        last_snapshot: 0,
        flags: 0,
        refs: 1,
        drop_progress: Key::default(),
        drop_level: 0,
        level: 0,
    };
    let mut payload = vec![0_u8; 239];
    item.write_to(&mut payload).expect("root item encode");
    payload
}

fn make_leaf(bytenr: u64, owner: u64, items: &[(Key, Vec<u8>)]) -> TreeBlock {
    let mut leaf = TreeBlock::new_empty(bytenr, BLOCK, 0, owner, GENERATION, FSID, CHUNK_UUID)
        .expect("leaf");
    for (slot, (key, data)) in items.iter().enumerate() {
        leaf.insert_item_with(slot, *key, data).expect("item");
    }
    leaf.stamp_csum().expect("csum");
    leaf
}

fn write_block(device: &MemByteDevice, physical: u64, block: &TreeBlock) {
    device.write_all_at(physical, block.buf()).expect("write block");
}

pub(crate) fn build(spec: ImageSpec) -> TestImage {
    let device = MemByteDevice::new(spec.device_len);
    let data_stripe_bases = &[DATA_PHYSICAL, DATA_PHYSICAL_MIRROR][..spec.data_stripes];

    // Data sectors, identical on every stripe, and their checksum run.
    let mut csums = Vec::with_capacity(spec.data_sectors * 4);
    for i in 0..spec.data_sectors {
        let sector = data_sector(i);
        for base in data_stripe_bases {
            device
                .write_all_at(base + (i * BLOCK) as u64, &sector)
                .expect("write data");
        }
        csums.extend_from_slice(&crc32c::crc32c(&sector).to_le_bytes());
    }
    let csum_leaf = make_leaf(
        CSUM_TREE_BYTENR,
        CSUM_TREE_OBJECTID,
        &[(Key::csum(DATA_LOGICAL), csums)],
    );
    write_block(&device, meta_physical(CSUM_TREE_BYTENR), &csum_leaf);

    // A few uuid tree entries (subvol uuid halves -> subvol id).
    let mut uuid_items = Vec::new();
    for i in 0..spec.uuid_items {
        let key = Key::new(0x1111 + i as u64, 251, 0x2222 + i as u64);
        uuid_items.push((key, 260_u64.to_le_bytes().to_vec()));
    }
    let uuid_leaf = make_leaf(UUID_TREE_BYTENR, UUID_TREE_OBJECTID, &uuid_items);
    write_block(&device, meta_physical(UUID_TREE_BYTENR), &uuid_leaf);

    // Root tree: root items for the csum and uuid trees.
    let root_leaf = make_leaf(
        ROOT_TREE_BYTENR,
        ROOT_TREE_OBJECTID,
        &[
            (
                Key::new(CSUM_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                root_item_payload(CSUM_TREE_BYTENR),
            ),
            (
                Key::new(UUID_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                root_item_payload(UUID_TREE_BYTENR),
            ),
        ],
    );
    write_block(&device, meta_physical(ROOT_TREE_BYTENR), &root_leaf);

    // Chunk tree: dev item plus the three chunks.
    let sys_chunk = chunk_entry(SYS_LOGICAL, SYS_LEN, SYS_PHYSICAL, BLOCK_GROUP_SYSTEM);
    let meta_chunk = chunk_entry(META_LOGICAL, META_LEN, META_PHYSICAL, BLOCK_GROUP_METADATA);
    let data_chunk = chunk_entry_striped(DATA_LOGICAL, DATA_LEN, data_stripe_bases, BLOCK_GROUP_DATA);
    let mut dev_item_payload = vec![0_u8; 98];
    dev_item(spec.device_len as u64)
        .write_at(&mut dev_item_payload, 0)
        .expect("dev item encode");
    let chunk_leaf = make_leaf(
        CHUNK_TREE_BYTENR,
        CHUNK_TREE_OBJECTID,
        &[
            (
                Key::new(DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, 1),
                dev_item_payload,
            ),
            (
                sys_chunk.key,
                btr_ondisk::encode_chunk_payload(&sys_chunk).expect("chunk encode"),
            ),
            (
                meta_chunk.key,
                btr_ondisk::encode_chunk_payload(&meta_chunk).expect("chunk encode"),
            ),
            (
                data_chunk.key,
                btr_ondisk::encode_chunk_payload(&data_chunk).expect("chunk encode"),
            ),
        ],
    );
    write_block(&device, SYS_PHYSICAL, &chunk_leaf);

    // Superblock: only the system chunk rides in the sys array.
    let superblock = Superblock {
        csum: [0; 32],
        fsid: FSID,
        bytenr: SUPER_INFO_OFFSET,
        flags: 1,
        magic: BTRFS_MAGIC,
        generation: GENERATION,
        root: ROOT_TREE_BYTENR,
        chunk_root: CHUNK_TREE_BYTENR,
        log_root: spec.log_root,
        log_root_transid: if spec.log_root == 0 { 0 } else { GENERATION },
        total_bytes: spec.device_len as u64,
        bytes_used: SYS_LEN + META_LEN + DATA_LEN,
        root_dir_objectid: 6,
        num_devices: 1,
        sectorsize: BLOCK as u32,
        nodesize: BLOCK as u32,
        stripesize: BLOCK as u32,
        chunk_root_generation: GENERATION,
        compat_flags: 0,
        compat_ro_flags: 0,
        incompat_flags: 0,
        csum_type: CSUM_TYPE_CRC32C,
        root_level: 0,
        chunk_root_level: 0,
        log_root_level: if spec.log_root == 0 { 0 } else { 1 },
        dev_item: dev_item(spec.device_len as u64),
        label: "testimg".to_owned(),
        cache_generation: 5,
        uuid_tree_generation: GENERATION,
        sys_chunk_array_size: 0,
        sys_chunk_array: encode_sys_chunk_array(std::slice::from_ref(&sys_chunk))
            .expect("sys array"),
    };

    let mut primary = None;
    for offset in crate::open::super_copy_offsets(spec.device_len as u64) {
        let mut copy = superblock.clone();
        copy.bytenr = offset;
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        copy.write_to_region(&mut region).expect("super encode");
        stamp_super_csum(&mut region).expect("super csum");
        device.write_all_at(offset, &region).expect("write super");
        if offset == SUPER_INFO_OFFSET {
            primary = Some(Superblock::parse_region(&region).expect("super parse"));
        }
    }

    TestImage {
        device,
        superblock: primary.expect("primary superblock"),
    }
}

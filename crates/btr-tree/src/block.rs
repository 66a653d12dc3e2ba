//! Owned tree block with in-place leaf and node mutation.
//!
//! A leaf block is a 101-byte header, a directory of 25-byte item entries
//! growing downward from the header, and packed item payloads growing upward
//! from the end of the block. Entry offsets are relative to the end of the
//! header. An internal node holds 33-byte key pointers after the header.
//!
//! All mutating operations preserve the packing invariant: payloads are
//! contiguous, slot 0 highest, and every mutation either fully applies or
//! leaves the block byte-identical.

use btr_error::{BtrError, Result};
use btr_ondisk::{Header, block_csum_matches, read_key_at, stamp_block_csum, write_key_at};
use btr_types::{HEADER_SIZE, KEY_PTR_SIZE, Key, LEAF_ITEM_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlock {
    bytenr: u64,
    buf: Vec<u8>,
}

impl TreeBlock {
    /// Build an empty block with a fully initialized header.
    pub fn new_empty(
        bytenr: u64,
        block_size: usize,
        level: u8,
        owner: u64,
        generation: u64,
        fsid: [u8; 16],
        chunk_tree_uuid: [u8; 16],
    ) -> Result<Self> {
        if block_size <= HEADER_SIZE {
            return Err(BtrError::InvalidArgument(format!(
                "block size {block_size} leaves no payload space"
            )));
        }
        let header = Header {
            csum: [0; 32],
            fsid,
            bytenr,
            flags: 0,
            chunk_tree_uuid,
            generation,
            owner,
            nritems: 0,
            level,
        };
        let mut buf = vec![0_u8; block_size];
        header
            .write_to_block(&mut buf)
            .map_err(|err| BtrError::Parse(err.to_string()))?;
        Ok(Self { bytenr, buf })
    }

    /// Take ownership of raw block bytes, validating the header and, when
    /// `verify_csum` is set, the stored crc32c.
    pub fn from_bytes(bytenr: u64, buf: Vec<u8>, verify_csum: bool) -> Result<Self> {
        let header = Header::parse_from_block(&buf).map_err(|err| BtrError::CorruptBlock {
            bytenr,
            detail: err.to_string(),
        })?;
        header
            .validate(buf.len(), Some(bytenr))
            .map_err(|err| BtrError::CorruptBlock {
                bytenr,
                detail: err.to_string(),
            })?;
        if verify_csum && !block_csum_matches(&buf) {
            return Err(BtrError::CorruptBlock {
                bytenr,
                detail: "checksum mismatch".to_owned(),
            });
        }

        let block = Self { bytenr, buf };
        if header.level == 0 {
            block.check_leaf_packing()?;
        }
        Ok(block)
    }

    fn check_leaf_packing(&self) -> Result<()> {
        let mut expected_end = self.leaf_data_size();
        for slot in 0..self.nritems() {
            let offset = self.item_offset(slot)? as usize;
            let size = self.item_size(slot)? as usize;
            let end = offset.checked_add(size).ok_or_else(|| self.corrupt("item range overflow"))?;
            if end != expected_end {
                return Err(self.corrupt("leaf payloads are not packed"));
            }
            if offset > self.leaf_data_size() {
                return Err(self.corrupt("item payload outside block"));
            }
            expected_end = offset;
        }
        let dir_end = self.nritems() * LEAF_ITEM_SIZE;
        if dir_end > expected_end {
            return Err(self.corrupt("item directory overlaps payloads"));
        }
        Ok(())
    }

    fn corrupt(&self, detail: &str) -> BtrError {
        BtrError::CorruptBlock {
            bytenr: self.bytenr,
            detail: detail.to_owned(),
        }
    }

    fn slot_check(&self, slot: usize) -> Result<()> {
        if slot >= self.nritems() {
            return Err(BtrError::InvalidArgument(format!(
                "slot {slot} out of range, block has {} items",
                self.nritems()
            )));
        }
        Ok(())
    }

    // ── header field access ─────────────────────────────────────────────────

    #[must_use]
    pub fn bytenr(&self) -> u64 {
        self.bytenr
    }

    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn header(&self) -> Result<Header> {
        Header::parse_from_block(&self.buf).map_err(|err| BtrError::CorruptBlock {
            bytenr: self.bytenr,
            detail: err.to_string(),
        })
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.buf[0x64]
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        u32::from_le_bytes([self.buf[0x60], self.buf[0x61], self.buf[0x62], self.buf[0x63]])
            as usize
    }

    fn set_nritems(&mut self, nritems: usize) {
        let value = u32::try_from(nritems).unwrap_or(u32::MAX);
        self.buf[0x60..0x64].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        u64::from_le_bytes(self.buf[0x50..0x58].try_into().unwrap_or([0; 8]))
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.buf[0x50..0x58].copy_from_slice(&generation.to_le_bytes());
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        u64::from_le_bytes(self.buf[0x58..0x60].try_into().unwrap_or([0; 8]))
    }

    #[must_use]
    pub fn fsid(&self) -> [u8; 16] {
        self.buf[0x20..0x30].try_into().unwrap_or([0; 16])
    }

    /// Payload capacity below the header.
    #[must_use]
    pub fn leaf_data_size(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Maximum key pointers an internal node of this size can hold.
    #[must_use]
    pub fn node_capacity(&self) -> usize {
        self.leaf_data_size() / KEY_PTR_SIZE
    }

    /// Stamp the block checksum over the current contents.
    pub fn stamp_csum(&mut self) -> Result<()> {
        stamp_block_csum(&mut self.buf).map_err(|err| BtrError::Parse(err.to_string()))
    }

    // ── shared key access ───────────────────────────────────────────────────

    fn entry_base(&self, slot: usize) -> usize {
        let stride = if self.is_leaf() { LEAF_ITEM_SIZE } else { KEY_PTR_SIZE };
        HEADER_SIZE + slot * stride
    }

    /// Key at `slot`, for either a leaf item or a node key pointer.
    pub fn key(&self, slot: usize) -> Result<Key> {
        self.slot_check(slot)?;
        read_key_at(&self.buf, self.entry_base(slot)).map_err(|err| BtrError::CorruptBlock {
            bytenr: self.bytenr,
            detail: err.to_string(),
        })
    }

    /// Overwrite the key at `slot` without moving any data.
    pub fn set_key(&mut self, slot: usize, key: Key) -> Result<()> {
        self.slot_check(slot)?;
        let base = self.entry_base(slot);
        write_key_at(&mut self.buf, base, key).map_err(|err| BtrError::Parse(err.to_string()))
    }

    /// Binary search over the block's keys.
    ///
    /// Returns `(slot, true)` on an exact match, else `(slot, false)` where
    /// `slot` is the index of the first key greater than `target` (the
    /// insertion point).
    pub fn search(&self, target: Key) -> Result<(usize, bool)> {
        let mut low = 0_usize;
        let mut high = self.nritems();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid)?.cmp(&target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((low, false))
    }

    // ── leaf item access ────────────────────────────────────────────────────

    pub fn item_offset(&self, slot: usize) -> Result<u32> {
        self.slot_check(slot)?;
        let base = self.entry_base(slot) + 17;
        Ok(u32::from_le_bytes(
            self.buf[base..base + 4].try_into().unwrap_or([0; 4]),
        ))
    }

    pub fn item_size(&self, slot: usize) -> Result<u32> {
        self.slot_check(slot)?;
        let base = self.entry_base(slot) + 21;
        Ok(u32::from_le_bytes(
            self.buf[base..base + 4].try_into().unwrap_or([0; 4]),
        ))
    }

    fn set_item_offset(&mut self, slot: usize, offset: u32) {
        let base = self.entry_base(slot) + 17;
        self.buf[base..base + 4].copy_from_slice(&offset.to_le_bytes());
    }

    fn set_item_size(&mut self, slot: usize, size: u32) {
        let base = self.entry_base(slot) + 21;
        self.buf[base..base + 4].copy_from_slice(&size.to_le_bytes());
    }

    fn item_range(&self, slot: usize) -> Result<std::ops::Range<usize>> {
        let offset = self.item_offset(slot)? as usize;
        let size = self.item_size(slot)? as usize;
        let start = HEADER_SIZE + offset;
        let end = start.checked_add(size).ok_or_else(|| self.corrupt("item range overflow"))?;
        if end > self.buf.len() {
            return Err(self.corrupt("item payload outside block"));
        }
        Ok(start..end)
    }

    pub fn item_data(&self, slot: usize) -> Result<&[u8]> {
        let range = self.item_range(slot)?;
        Ok(&self.buf[range])
    }

    pub fn item_data_mut(&mut self, slot: usize) -> Result<&mut [u8]> {
        let range = self.item_range(slot)?;
        Ok(&mut self.buf[range])
    }

    /// Offset of the lowest payload byte, relative to the end of the header.
    fn data_end(&self) -> Result<usize> {
        let n = self.nritems();
        if n == 0 {
            return Ok(self.leaf_data_size());
        }
        Ok(self.item_offset(n - 1)? as usize)
    }

    /// Unused bytes between the item directory and the packed payloads.
    pub fn free_space(&self) -> Result<usize> {
        let dir_end = self.nritems() * LEAF_ITEM_SIZE;
        let data_end = self.data_end()?;
        data_end
            .checked_sub(dir_end)
            .ok_or_else(|| self.corrupt("item directory overlaps payloads"))
    }

    // ── leaf mutation ───────────────────────────────────────────────────────

    /// Insert a zero-filled item of `size` bytes at `slot`, shifting the
    /// directory right and the packed payloads down.
    ///
    /// Fails with `NoSpace`, leaving the block untouched, when the entry
    /// plus payload does not fit.
    pub fn insert_item(&mut self, slot: usize, key: Key, size: usize) -> Result<()> {
        let n = self.nritems();
        if slot > n {
            return Err(BtrError::InvalidArgument(format!(
                "insert slot {slot} beyond {n} items"
            )));
        }
        let needed = LEAF_ITEM_SIZE + size;
        if self.free_space()? < needed {
            return Err(BtrError::NoSpace);
        }

        let data_end = self.data_end()?;
        let upper = if slot == 0 {
            self.leaf_data_size()
        } else {
            self.item_offset(slot - 1)? as usize
        };

        // Payloads of slots >= slot move down to open the gap.
        self.buf
            .copy_within(HEADER_SIZE + data_end..HEADER_SIZE + upper, HEADER_SIZE + data_end - size);
        for i in slot..n {
            let off = self.item_offset(i)?;
            self.set_item_offset(i, off - u32::try_from(size).unwrap_or(u32::MAX));
        }

        // Directory entries shift right by one.
        let dir_start = HEADER_SIZE + slot * LEAF_ITEM_SIZE;
        let dir_end = HEADER_SIZE + n * LEAF_ITEM_SIZE;
        self.buf.copy_within(dir_start..dir_end, dir_start + LEAF_ITEM_SIZE);

        self.set_nritems(n + 1);
        write_key_at(&mut self.buf, dir_start, key)
            .map_err(|err| BtrError::Parse(err.to_string()))?;
        let new_offset = upper - size;
        self.set_item_offset(slot, u32::try_from(new_offset).unwrap_or(u32::MAX));
        self.set_item_size(slot, u32::try_from(size).unwrap_or(u32::MAX));
        self.buf[HEADER_SIZE + new_offset..HEADER_SIZE + new_offset + size].fill(0);
        Ok(())
    }

    /// Insert an item carrying `data` at `slot`.
    pub fn insert_item_with(&mut self, slot: usize, key: Key, data: &[u8]) -> Result<()> {
        self.insert_item(slot, key, data.len())?;
        self.item_data_mut(slot)?.copy_from_slice(data);
        Ok(())
    }

    /// Remove `count` items starting at `slot`, repacking payloads and the
    /// directory.
    pub fn remove_items(&mut self, slot: usize, count: usize) -> Result<()> {
        let n = self.nritems();
        if count == 0 {
            return Ok(());
        }
        let last = slot
            .checked_add(count)
            .filter(|end| *end <= n)
            .ok_or_else(|| {
                BtrError::InvalidArgument(format!("remove {count} items at slot {slot} of {n}"))
            })?;

        let mut removed_bytes = 0_usize;
        for i in slot..last {
            removed_bytes += self.item_size(i)? as usize;
        }

        let data_end = self.data_end()?;
        let removed_low = self.item_offset(last - 1)? as usize;

        // Payloads of the surviving items below the hole move up.
        self.buf.copy_within(
            HEADER_SIZE + data_end..HEADER_SIZE + removed_low,
            HEADER_SIZE + data_end + removed_bytes,
        );
        for i in last..n {
            let off = self.item_offset(i)?;
            self.set_item_offset(i, off + u32::try_from(removed_bytes).unwrap_or(0));
        }

        let dir_dst = HEADER_SIZE + slot * LEAF_ITEM_SIZE;
        let dir_src = HEADER_SIZE + last * LEAF_ITEM_SIZE;
        let dir_end = HEADER_SIZE + n * LEAF_ITEM_SIZE;
        self.buf.copy_within(dir_src..dir_end, dir_dst);

        self.set_nritems(n - count);
        Ok(())
    }

    /// Grow the item at `slot` by `delta` bytes at its payload end.
    ///
    /// The new bytes are zeroed. Fails with `NoSpace`, block untouched,
    /// when the leaf lacks `delta` free bytes.
    pub fn extend_item(&mut self, slot: usize, delta: usize) -> Result<()> {
        self.slot_check(slot)?;
        if self.free_space()? < delta {
            return Err(BtrError::NoSpace);
        }
        if delta == 0 {
            return Ok(());
        }

        let n = self.nritems();
        let data_end = self.data_end()?;
        let old_offset = self.item_offset(slot)? as usize;
        let old_size = self.item_size(slot)? as usize;

        // The item's own payload and everything after it move down.
        self.buf.copy_within(
            HEADER_SIZE + data_end..HEADER_SIZE + old_offset + old_size,
            HEADER_SIZE + data_end - delta,
        );
        for i in slot..n {
            let off = self.item_offset(i)?;
            self.set_item_offset(i, off - u32::try_from(delta).unwrap_or(u32::MAX));
        }
        self.set_item_size(slot, u32::try_from(old_size + delta).unwrap_or(u32::MAX));

        let tail_start = HEADER_SIZE + old_offset + old_size - delta;
        self.buf[tail_start..tail_start + delta].fill(0);
        Ok(())
    }

    /// Shrink the item at `slot` to `new_size` bytes.
    ///
    /// With `keep_front` the payload tail is cut; otherwise the payload head
    /// is cut and the caller must rewrite the key to match the surviving
    /// content.
    pub fn truncate_item(&mut self, slot: usize, new_size: usize, keep_front: bool) -> Result<()> {
        self.slot_check(slot)?;
        let old_size = self.item_size(slot)? as usize;
        if new_size > old_size {
            return Err(BtrError::InvalidArgument(format!(
                "truncate_item grows the item: {old_size} -> {new_size}"
            )));
        }
        let diff = old_size - new_size;
        if diff == 0 {
            return Ok(());
        }

        let n = self.nritems();
        let data_end = self.data_end()?;
        let old_offset = self.item_offset(slot)? as usize;

        if keep_front {
            // Kept head plus every later payload move up over the cut tail.
            self.buf.copy_within(
                HEADER_SIZE + data_end..HEADER_SIZE + old_offset + new_size,
                HEADER_SIZE + data_end + diff,
            );
        } else {
            // Kept tail stays put; only later payloads move up.
            self.buf.copy_within(
                HEADER_SIZE + data_end..HEADER_SIZE + old_offset,
                HEADER_SIZE + data_end + diff,
            );
        }
        for i in slot..n {
            let off = self.item_offset(i)?;
            self.set_item_offset(i, off + u32::try_from(diff).unwrap_or(0));
        }
        self.set_item_size(slot, u32::try_from(new_size).unwrap_or(u32::MAX));
        Ok(())
    }

    /// Split the item at `slot` in place at payload byte `split_offset`.
    ///
    /// The head keeps the original key at `slot` with `split_offset` bytes;
    /// the tail becomes a new item at `slot + 1` under `new_key`. Only a
    /// directory entry's worth of free space is needed: the tail payload
    /// does not move, the head is relocated above it.
    pub fn split_item(&mut self, slot: usize, new_key: Key, split_offset: usize) -> Result<()> {
        self.slot_check(slot)?;
        let old_size = self.item_size(slot)? as usize;
        if split_offset == 0 || split_offset >= old_size {
            return Err(BtrError::InvalidArgument(format!(
                "split offset {split_offset} outside item of {old_size} bytes"
            )));
        }
        if self.free_space()? < LEAF_ITEM_SIZE {
            return Err(BtrError::NoSpace);
        }

        let n = self.nritems();
        let old_offset = self.item_offset(slot)? as usize;
        let content = self.item_data(slot)?.to_vec();

        // Directory entries after the split point shift right by one.
        let dir_start = HEADER_SIZE + (slot + 1) * LEAF_ITEM_SIZE;
        let dir_end = HEADER_SIZE + n * LEAF_ITEM_SIZE;
        self.buf.copy_within(dir_start..dir_end, dir_start + LEAF_ITEM_SIZE);
        self.set_nritems(n + 1);

        // Tail keeps the original payload position.
        write_key_at(&mut self.buf, dir_start, new_key)
            .map_err(|err| BtrError::Parse(err.to_string()))?;
        self.set_item_offset(slot + 1, u32::try_from(old_offset).unwrap_or(u32::MAX));
        self.set_item_size(slot + 1, u32::try_from(old_size - split_offset).unwrap_or(u32::MAX));

        // Head moves above the tail, abutting the previous item as before.
        let head_offset = old_offset + old_size - split_offset;
        self.set_item_offset(slot, u32::try_from(head_offset).unwrap_or(u32::MAX));
        self.set_item_size(slot, u32::try_from(split_offset).unwrap_or(u32::MAX));

        self.item_data_mut(slot)?.copy_from_slice(&content[..split_offset]);
        self.item_data_mut(slot + 1)?.copy_from_slice(&content[split_offset..]);
        Ok(())
    }

    // ── node key pointer access ─────────────────────────────────────────────

    pub fn node_blockptr(&self, slot: usize) -> Result<u64> {
        self.slot_check(slot)?;
        let base = self.entry_base(slot) + 17;
        Ok(u64::from_le_bytes(
            self.buf[base..base + 8].try_into().unwrap_or([0; 8]),
        ))
    }

    pub fn node_ptr_generation(&self, slot: usize) -> Result<u64> {
        self.slot_check(slot)?;
        let base = self.entry_base(slot) + 25;
        Ok(u64::from_le_bytes(
            self.buf[base..base + 8].try_into().unwrap_or([0; 8]),
        ))
    }

    /// Insert a key pointer at `slot`, shifting later pointers right.
    pub fn insert_ptr(&mut self, slot: usize, key: Key, blockptr: u64, generation: u64) -> Result<()> {
        let n = self.nritems();
        if slot > n {
            return Err(BtrError::InvalidArgument(format!(
                "insert slot {slot} beyond {n} pointers"
            )));
        }
        if n >= self.node_capacity() {
            return Err(BtrError::NoSpace);
        }

        let base = HEADER_SIZE + slot * KEY_PTR_SIZE;
        let end = HEADER_SIZE + n * KEY_PTR_SIZE;
        self.buf.copy_within(base..end, base + KEY_PTR_SIZE);
        self.set_nritems(n + 1);

        write_key_at(&mut self.buf, base, key).map_err(|err| BtrError::Parse(err.to_string()))?;
        self.buf[base + 17..base + 25].copy_from_slice(&blockptr.to_le_bytes());
        self.buf[base + 25..base + 33].copy_from_slice(&generation.to_le_bytes());
        Ok(())
    }

    /// Remove the key pointer at `slot`, shifting later pointers left.
    pub fn remove_ptr(&mut self, slot: usize) -> Result<()> {
        self.slot_check(slot)?;
        let n = self.nritems();
        let base = HEADER_SIZE + slot * KEY_PTR_SIZE;
        let src = base + KEY_PTR_SIZE;
        let end = HEADER_SIZE + n * KEY_PTR_SIZE;
        self.buf.copy_within(src..end, base);
        self.set_nritems(n - 1);
        Ok(())
    }
}

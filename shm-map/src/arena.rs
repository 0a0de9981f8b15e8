//! Variable length byte storage inside the mapped segment.
//!
//! Blocks are handed out from per-size-class free lists first and bumped from the high-water mark
//! (`arena_top`) otherwise. Capacities are rounded up to 8 bytes; freed blocks go back onto the
//! list of their class and are only ever reused for that class. Blocks larger than the small
//! classes share one list which is searched first-fit. There is no splitting, coalescing or
//! compaction.
//!
//! All methods assume the caller holds the segment lock, exclusive for anything that mutates.
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::Capacity;
use crate::layout::{
    block_capacity, size_class, BlockHeader, HeaderPage, BLOCK_ALIGN, BLOCK_HEADER_SIZE,
    FREE_LISTS, NIL, SMALL_CLASSES,
};

pub(crate) struct Arena<'lt> {
    header: &'lt HeaderPage,
    bytes: &'lt [AtomicU8],
}

/// A block, by its offset relative to the start of the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    pub offset: u64,
    pub capacity: u64,
}

/// Usage figures of the arena, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// The configured `max_bytes`.
    pub pool_size: u64,
    /// Never handed out, above the high-water mark.
    pub free_area_size: u64,
    /// Below the high-water mark.
    pub allocated_area_size: u64,
    /// Below the high-water mark but sitting on a free list.
    pub allocated_area_free_size: u64,
    /// Held by live entries, block headers included.
    pub real_used_size: u64,
}

/// Occupancy of one free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeListClass {
    /// Payload capacity of the blocks, or the smallest capacity of the overflow list.
    pub capacity: u64,
    /// Number of blocks waiting on the list.
    pub blocks: u64,
    /// Sum of the footprints of those blocks.
    pub bytes: u64,
}

impl Block {
    /// Offset of the first payload byte.
    pub fn payload(&self) -> u64 {
        self.offset + BLOCK_HEADER_SIZE
    }

    /// Bytes accounted for this block in `bytes_used`.
    pub fn footprint(&self) -> u64 {
        self.capacity + BLOCK_HEADER_SIZE
    }
}

impl<'lt> Arena<'lt> {
    pub(crate) fn new(header: &'lt HeaderPage, bytes: &'lt [AtomicU8]) -> Self {
        debug_assert_eq!(bytes.as_ptr() as usize % BLOCK_ALIGN as usize, 0);
        Arena { header, bytes }
    }

    pub(crate) fn max_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The high-water mark.
    pub(crate) fn top(&self) -> u64 {
        self.header.arena_top.load(Ordering::SeqCst)
    }

    /// Reserve a block for `len` payload bytes.
    ///
    /// Nothing is modified when this fails.
    pub(crate) fn alloc(&self, len: u64) -> Result<Block, Capacity> {
        let exhausted = Capacity::Bytes {
            requested: len,
            max_bytes: self.max_bytes(),
        };

        let capacity = block_capacity(len).ok_or(exhausted)?;
        let class = size_class(capacity);

        let reused = if class < SMALL_CLASSES {
            self.pop(class)
        } else {
            self.take_first_fit(capacity)
        };

        let block = reused.or_else(|| self.bump(capacity)).ok_or(exhausted)?;
        self.header
            .bytes_used
            .fetch_add(block.footprint(), Ordering::SeqCst);
        Ok(block)
    }

    /// Return a block to its free list.
    pub(crate) fn free(&self, block: Block) {
        let head = &self.header.free_heads[size_class(block.capacity)];
        let meta = self.block_header(block.offset);
        meta.next.store(head.load(Ordering::Relaxed), Ordering::Relaxed);
        head.store(block.offset, Ordering::Release);

        self.header
            .bytes_used
            .fetch_sub(block.footprint(), Ordering::SeqCst);
    }

    /// Reconstruct the block whose payload starts at `payload`.
    pub(crate) fn block_of(&self, payload: u64) -> Block {
        let offset = payload - BLOCK_HEADER_SIZE;
        let capacity = self.block_header(offset).capacity.load(Ordering::Relaxed);
        Block { offset, capacity }
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) {
        for (cell, &byte) in self.region(offset, data.len() as u64).iter().zip(data) {
            cell.store(byte, Ordering::Relaxed);
        }
    }

    /// Append the bytes at `offset..offset + len` to `into`.
    pub(crate) fn read_into(&self, offset: u64, len: u64, into: &mut Vec<u8>) {
        let region = self.region(offset, len);
        into.reserve(region.len());
        into.extend(region.iter().map(|cell| cell.load(Ordering::Relaxed)));
    }

    pub(crate) fn to_vec(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut out = Vec::new();
        self.read_into(offset, len, &mut out);
        out
    }

    /// Byte-wise comparison without copying out of the segment.
    pub(crate) fn eq(&self, offset: u64, len: u64, data: &[u8]) -> bool {
        len == data.len() as u64
            && self
                .region(offset, len)
                .iter()
                .zip(data)
                .all(|(cell, &byte)| cell.load(Ordering::Relaxed) == byte)
    }

    pub(crate) fn memory_info(&self) -> MemoryInfo {
        let top = self.top();
        let free_blocks: u64 = self.free_list_info().iter().map(|class| class.bytes).sum();

        MemoryInfo {
            pool_size: self.max_bytes(),
            free_area_size: self.max_bytes() - top,
            allocated_area_size: top,
            allocated_area_free_size: free_blocks,
            real_used_size: self.header.bytes_used.load(Ordering::SeqCst),
        }
    }

    /// All non-empty free lists, by ascending capacity.
    pub(crate) fn free_list_info(&self) -> Vec<FreeListClass> {
        let mut classes = Vec::new();

        for (class, head) in self.header.free_heads.iter().enumerate() {
            let mut blocks = 0;
            let mut bytes = 0;
            let mut min_capacity = u64::MAX;

            for block in self.walk(head) {
                blocks += 1;
                bytes += block.footprint();
                min_capacity = min_capacity.min(block.capacity);
            }

            if blocks == 0 {
                continue;
            }

            let capacity = if class < SMALL_CLASSES {
                (class as u64 + 1) * BLOCK_ALIGN
            } else {
                min_capacity
            };

            classes.push(FreeListClass {
                capacity,
                blocks,
                bytes,
            });
        }

        classes
    }

    fn pop(&self, class: usize) -> Option<Block> {
        let head = &self.header.free_heads[class];
        let offset = head.load(Ordering::Acquire);

        if offset == NIL {
            return None;
        }

        let meta = self.block_header(offset);
        head.store(meta.next.load(Ordering::Relaxed), Ordering::Release);
        meta.next.store(NIL, Ordering::Relaxed);

        Some(Block {
            offset,
            capacity: meta.capacity.load(Ordering::Relaxed),
        })
    }

    fn take_first_fit(&self, capacity: u64) -> Option<Block> {
        let mut link: &AtomicU64 = &self.header.free_heads[SMALL_CLASSES];

        for _ in 0..self.max_blocks() {
            let offset = link.load(Ordering::Acquire);
            if offset == NIL {
                return None;
            }

            let meta = self.block_header(offset);
            let found = meta.capacity.load(Ordering::Relaxed);

            if found >= capacity {
                link.store(meta.next.load(Ordering::Relaxed), Ordering::Release);
                meta.next.store(NIL, Ordering::Relaxed);
                return Some(Block {
                    offset,
                    capacity: found,
                });
            }

            link = &meta.next;
        }

        None
    }

    fn bump(&self, capacity: u64) -> Option<Block> {
        let top = self.top();
        let end = top
            .checked_add(BLOCK_HEADER_SIZE)?
            .checked_add(capacity)?;

        if end > self.max_bytes() {
            return None;
        }

        let meta = self.block_header(top);
        meta.capacity.store(capacity, Ordering::Relaxed);
        meta.next.store(NIL, Ordering::Relaxed);
        self.header.arena_top.store(end, Ordering::SeqCst);

        Some(Block {
            offset: top,
            capacity,
        })
    }

    /// Iterate a free list. Bounded so a corrupted cycle can not hang the caller.
    fn walk<'a>(&'a self, head: &AtomicU64) -> impl Iterator<Item = Block> + 'a {
        let mut next = head.load(Ordering::Acquire);
        let mut budget = self.max_blocks();

        core::iter::from_fn(move || {
            if next == NIL || budget == 0 {
                return None;
            }

            budget -= 1;
            let meta = self.block_header(next);
            let block = Block {
                offset: next,
                capacity: meta.capacity.load(Ordering::Relaxed),
            };

            next = meta.next.load(Ordering::Relaxed);
            Some(block)
        })
    }

    /// Upper bound on the number of blocks below the high-water mark.
    fn max_blocks(&self) -> u64 {
        self.header.arena_top.load(Ordering::Relaxed) / (BLOCK_HEADER_SIZE + BLOCK_ALIGN)
    }

    fn region(&self, offset: u64, len: u64) -> &[AtomicU8] {
        let start = offset as usize;
        &self.bytes[start..start + len as usize]
    }

    fn block_header(&self, offset: u64) -> &BlockHeader {
        debug_assert_eq!(offset % BLOCK_ALIGN, 0);
        let raw = self.region(offset, BLOCK_HEADER_SIZE);

        unsafe {
            // Safety: `BlockHeader` is two `AtomicU64`. The arena base is 8-aligned and every
            // block offset is a multiple of 8, the region was bounds checked above. Atomics have
            // no uniqueness requirement so aliasing with the byte view is fine.
            &*(raw.as_ptr() as *const BlockHeader)
        }
    }
}

const _: () = assert!(FREE_LISTS == SMALL_CLASSES + 1);

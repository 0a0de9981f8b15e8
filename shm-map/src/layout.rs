//! The on-disk format, and the arithmetic from configured capacities to byte offsets.
//!
//! ```text
//! +-------------+---------------------------------+----------------------------------+
//! | HeaderPage  | Slot * max_entries              | arena, max_bytes                 |
//! +-------------+---------------------------------+----------------------------------+
//! 0             HEADER_SIZE                       arena_offset                       file_len
//! ```
//!
//! Every field lives in the shared mapping and is an atomic. The file is always zero-filled on
//! creation which makes a fresh slot `EMPTY` and a fresh header unmagical. Offsets stored in the
//! mapping are relative to the start of the arena, never addresses, since each process maps the
//! file at its own base address.
use core::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::{Error, Result};

/// `b"SHMM"`, read as a native `u32`.
pub const MAGIC: u32 = u32::from_ne_bytes(*b"SHMM");
/// Bump this on any change of the types in this module.
pub const VERSION: u32 = 1;

/// Bytes reserved for the header, keeps the slot table away from the counters.
pub const HEADER_SIZE: usize = 512;

/// Number of exact-fit free lists. Class `i` holds blocks with `8 * (i + 1)` payload bytes.
pub const SMALL_CLASSES: usize = 32;
/// All free lists, the last one holds every block larger than the small classes.
pub const FREE_LISTS: usize = SMALL_CLASSES + 1;
/// Granularity of block capacities.
pub const BLOCK_ALIGN: u64 = 8;
/// Marks the end of a free list.
pub const NIL: u64 = u64::MAX;

#[repr(C)]
pub(crate) struct HeaderPage {
    /// Written last during creation, a file is only initialized when this matches.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub max_entries: AtomicU64,
    pub max_bytes: AtomicU64,
    /// Number of `OCCUPIED` slots.
    pub entry_count: AtomicU64,
    /// Sum of the footprints of all live arena blocks.
    pub bytes_used: AtomicU64,
    /// The bump pointer of the arena, everything below was handed out at some point.
    pub arena_top: AtomicU64,
    /// The pid of the process holding the exclusive lock, `0` when released.
    pub lock_state: AtomicU64,
    /// Heads of the size class free lists, `NIL` when empty.
    pub free_heads: [AtomicU64; FREE_LISTS],
}

/// Do not change without bumping `VERSION`.
#[repr(C)]
pub(crate) struct Slot {
    /// One of `EMPTY`, `OCCUPIED`, `TOMBSTONE`.
    pub state: AtomicU64,
    pub hash: AtomicU64,
    pub key_offset: AtomicU64,
    pub key_len: AtomicU64,
    pub value_offset: AtomicU64,
    pub value_len: AtomicU64,
}

/// Precedes every block in the arena. The payload directly follows.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Usable payload bytes, a multiple of `BLOCK_ALIGN`.
    pub capacity: AtomicU64,
    /// Free list link while the block is free.
    pub next: AtomicU64,
}

pub(crate) mod state {
    pub const EMPTY: u64 = 0;
    pub const OCCUPIED: u64 = 1;
    pub const TOMBSTONE: u64 = 2;
}

pub(crate) const SLOT_SIZE: usize = core::mem::size_of::<Slot>();
pub(crate) const BLOCK_HEADER_SIZE: u64 = core::mem::size_of::<BlockHeader>() as u64;

const _: () = assert!(core::mem::size_of::<HeaderPage>() <= HEADER_SIZE);
const _: () = assert!(SLOT_SIZE % 8 == 0);
const _: () = assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);

/// Byte offsets of the three regions of a segment.
///
/// Pure function of the two capacities, identical in every process that agrees on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub max_entries: u64,
    pub max_bytes: u64,
    pub header_offset: usize,
    pub slot_table_offset: usize,
    pub arena_offset: usize,
    /// Total length of the backing file.
    pub file_len: usize,
}

impl Layout {
    pub fn new(max_entries: u64, max_bytes: u64) -> Result<Self> {
        if max_entries == 0 {
            return Err(Error::Config("max_entries must be greater than 0".into()));
        }

        if max_bytes == 0 {
            return Err(Error::Config("max_bytes must be greater than 0".into()));
        }

        let overflow = || Error::Config(format!(
            "a segment of {max_entries} entries and {max_bytes} bytes does not fit the address space"
        ));

        let entries = usize::try_from(max_entries).map_err(|_| overflow())?;
        let bytes = usize::try_from(max_bytes).map_err(|_| overflow())?;

        let slot_table_offset = HEADER_SIZE;
        let slot_table_len = entries.checked_mul(SLOT_SIZE).ok_or_else(overflow)?;
        let arena_offset = slot_table_offset
            .checked_add(slot_table_len)
            .ok_or_else(overflow)?;
        let file_len = arena_offset.checked_add(bytes).ok_or_else(overflow)?;

        // Must also be representable as a file offset.
        i64::try_from(file_len).map_err(|_| overflow())?;

        Ok(Layout {
            max_entries,
            max_bytes,
            header_offset: 0,
            slot_table_offset,
            arena_offset,
            file_len,
        })
    }
}

/// Round a payload length up to the block granularity.
pub(crate) fn block_capacity(len: u64) -> Option<u64> {
    let len = len.max(BLOCK_ALIGN);
    len.checked_add(BLOCK_ALIGN - 1).map(|l| l & !(BLOCK_ALIGN - 1))
}

/// The free list index for blocks of this capacity.
pub(crate) fn size_class(capacity: u64) -> usize {
    debug_assert!(capacity % BLOCK_ALIGN == 0 && capacity > 0);
    let idx = capacity / BLOCK_ALIGN - 1;
    if idx < SMALL_CLASSES as u64 {
        idx as usize
    } else {
        SMALL_CLASSES
    }
}

#[test]
fn layout_is_contiguous() {
    let layout = Layout::new(10_000, 10_000_000).unwrap();
    assert_eq!(layout.header_offset, 0);
    assert_eq!(layout.slot_table_offset, HEADER_SIZE);
    assert_eq!(layout.arena_offset, HEADER_SIZE + 10_000 * SLOT_SIZE);
    assert_eq!(layout.file_len, layout.arena_offset + 10_000_000);
    assert_eq!(layout.arena_offset % 8, 0);
}

#[test]
fn layout_is_deterministic() {
    assert_eq!(Layout::new(7, 100).unwrap(), Layout::new(7, 100).unwrap());
    assert_ne!(Layout::new(7, 100).unwrap(), Layout::new(8, 100).unwrap());
}

#[test]
fn layout_rejects_zero_and_overflow() {
    assert!(matches!(Layout::new(0, 100), Err(Error::Config(_))));
    assert!(matches!(Layout::new(100, 0), Err(Error::Config(_))));
    assert!(matches!(Layout::new(u64::MAX, 1), Err(Error::Config(_))));
    assert!(matches!(Layout::new(1, u64::MAX), Err(Error::Config(_))));
}

#[test]
fn capacities_and_classes() {
    assert_eq!(block_capacity(0), Some(8));
    assert_eq!(block_capacity(1), Some(8));
    assert_eq!(block_capacity(8), Some(8));
    assert_eq!(block_capacity(9), Some(16));
    assert_eq!(block_capacity(u64::MAX), None);

    assert_eq!(size_class(8), 0);
    assert_eq!(size_class(16), 1);
    assert_eq!(size_class(256), SMALL_CLASSES - 1);
    assert_eq!(size_class(264), SMALL_CLASSES);
    assert_eq!(size_class(1 << 20), SMALL_CLASSES);
}

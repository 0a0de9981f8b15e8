//! Open addressing over the fixed slot array.
//!
//! A slot references one arena block holding the key bytes directly followed by the value bytes.
//! Probing is linear, starting at `hash % max_entries`, and visits each slot at most once. The
//! hash is FNV-1a, which has no per-process seed, so every process agrees on probe sequences.
//!
//! A slot becomes visible by storing `OCCUPIED` into its state with `Release` after every other
//! field was written; readers load the state with `Acquire`.
use core::sync::atomic::{AtomicU8, Ordering};

use crate::arena::{Arena, Block};
use crate::error::Capacity;
use crate::layout::{state, HeaderPage, Slot};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// The key hash, stable across processes and builds.
pub fn hash(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The counters of the header, read as one consistent snapshot under the segment lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Info {
    pub entry_count: u64,
    pub bytes_used: u64,
    pub max_entries: u64,
    pub max_bytes: u64,
}

pub(crate) struct Table<'lt> {
    header: &'lt HeaderPage,
    slots: &'lt [Slot],
    arena: Arena<'lt>,
}

enum Probe {
    /// The slot holding the key.
    Found(usize),
    /// The key is absent, this is the first reusable slot of its sequence.
    Vacant(usize),
    /// The key is absent and every slot of the sequence is occupied.
    Full,
}

impl<'lt> Table<'lt> {
    pub(crate) fn new(header: &'lt HeaderPage, slots: &'lt [Slot], arena: &'lt [AtomicU8]) -> Self {
        Table {
            header,
            slots,
            arena: Arena::new(header, arena),
        }
    }

    pub(crate) fn arena(&self) -> &Arena<'lt> {
        &self.arena
    }

    pub(crate) fn info(&self) -> Info {
        Info {
            entry_count: self.header.entry_count.load(Ordering::SeqCst),
            bytes_used: self.header.bytes_used.load(Ordering::SeqCst),
            max_entries: self.slots.len() as u64,
            max_bytes: self.arena.max_bytes(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_hashed(key, hash(key))
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.contains_hashed(key, hash(key))
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, Capacity> {
        self.put_hashed(key, value, hash(key))
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.remove_hashed(key, hash(key))
    }

    /// Visit every occupied slot in slot order.
    pub(crate) fn for_each(&self, mut visit: impl FnMut(&[u8], &[u8])) {
        let mut key = Vec::new();
        let mut value = Vec::new();

        for slot in self.slots {
            if slot.state.load(Ordering::Acquire) != state::OCCUPIED {
                continue;
            }

            key.clear();
            value.clear();
            self.arena.read_into(
                slot.key_offset.load(Ordering::Relaxed),
                slot.key_len.load(Ordering::Relaxed),
                &mut key,
            );
            self.arena.read_into(
                slot.value_offset.load(Ordering::Relaxed),
                slot.value_len.load(Ordering::Relaxed),
                &mut value,
            );

            visit(&key, &value);
        }
    }

    /// Recompute the header counters from the slot table.
    ///
    /// Used after a writer died while holding the lock, the counters may lag behind the slots.
    /// Returns the previous `(entry_count, bytes_used)`.
    pub(crate) fn recount(&self) -> (u64, u64) {
        let mut entries = 0;
        let mut bytes = 0;

        for slot in self.slots {
            if slot.state.load(Ordering::Acquire) == state::OCCUPIED {
                entries += 1;
                bytes += self.block(slot).footprint();
            }
        }

        let old_entries = self.header.entry_count.swap(entries, Ordering::SeqCst);
        let old_bytes = self.header.bytes_used.swap(bytes, Ordering::SeqCst);
        (old_entries, old_bytes)
    }

    fn get_hashed(&self, key: &[u8], hash: u64) -> Option<Vec<u8>> {
        match self.probe(key, hash) {
            Probe::Found(idx) => {
                let slot = &self.slots[idx];
                Some(self.arena.to_vec(
                    slot.value_offset.load(Ordering::Relaxed),
                    slot.value_len.load(Ordering::Relaxed),
                ))
            }
            Probe::Vacant(_) | Probe::Full => None,
        }
    }

    fn contains_hashed(&self, key: &[u8], hash: u64) -> bool {
        matches!(self.probe(key, hash), Probe::Found(_))
    }

    /// Insert or replace, returning the replaced value.
    ///
    /// All capacity checks happen before the first write into the segment.
    fn put_hashed(&self, key: &[u8], value: &[u8], hash: u64) -> Result<Option<Vec<u8>>, Capacity> {
        let key_len = key.len() as u64;
        let value_len = value.len() as u64;
        let payload = key_len.checked_add(value_len).ok_or(Capacity::Bytes {
            requested: u64::MAX,
            max_bytes: self.arena.max_bytes(),
        })?;

        match self.probe(key, hash) {
            Probe::Found(idx) => {
                let slot = &self.slots[idx];
                let old = self.block(slot);
                let previous = self.arena.to_vec(
                    slot.value_offset.load(Ordering::Relaxed),
                    slot.value_len.load(Ordering::Relaxed),
                );

                if payload <= old.capacity {
                    // Key bytes stay where they are, the value is overwritten behind them.
                    self.arena.write(old.payload() + key_len, value);
                    slot.value_len.store(value_len, Ordering::Release);
                } else {
                    let block = self.arena.alloc(payload)?;
                    self.fill(block, key, value);
                    self.link(slot, block, key_len, value_len);
                    self.arena.free(old);
                }

                Ok(Some(previous))
            }
            Probe::Vacant(idx) => {
                let max_entries = self.slots.len() as u64;
                if self.header.entry_count.load(Ordering::SeqCst) >= max_entries {
                    return Err(Capacity::Entries { max_entries });
                }

                let block = self.arena.alloc(payload)?;
                self.fill(block, key, value);

                let slot = &self.slots[idx];
                slot.hash.store(hash, Ordering::Relaxed);
                self.link(slot, block, key_len, value_len);
                slot.state.store(state::OCCUPIED, Ordering::Release);

                self.header.entry_count.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            Probe::Full => Err(Capacity::Entries {
                max_entries: self.slots.len() as u64,
            }),
        }
    }

    fn remove_hashed(&self, key: &[u8], hash: u64) -> Option<Vec<u8>> {
        let Probe::Found(idx) = self.probe(key, hash) else {
            return None;
        };

        let slot = &self.slots[idx];
        let block = self.block(slot);
        let previous = self.arena.to_vec(
            slot.value_offset.load(Ordering::Relaxed),
            slot.value_len.load(Ordering::Relaxed),
        );

        slot.state.store(state::TOMBSTONE, Ordering::Release);
        self.header.entry_count.fetch_sub(1, Ordering::SeqCst);
        self.arena.free(block);
        self.trim_tombstones(idx);

        Some(previous)
    }

    /// Turn the tombstones ending at `idx` back into empty slots, if an empty slot follows them.
    ///
    /// Any probe passing such a tombstone would reach the empty slot next and stop there anyway.
    fn trim_tombstones(&self, idx: usize) {
        let len = self.slots.len();
        let next = (idx + 1) % len;

        if self.slots[next].state.load(Ordering::Acquire) != state::EMPTY {
            return;
        }

        let mut idx = idx;
        for _ in 0..len {
            let slot = &self.slots[idx];
            if slot.state.load(Ordering::Acquire) != state::TOMBSTONE {
                break;
            }

            slot.state.store(state::EMPTY, Ordering::Release);
            idx = (idx + len - 1) % len;
        }
    }

    fn probe(&self, key: &[u8], hash: u64) -> Probe {
        let len = self.slots.len();
        let start = (hash % len as u64) as usize;
        let mut vacant = None;

        for step in 0..len {
            let idx = (start + step) % len;
            let slot = &self.slots[idx];

            match slot.state.load(Ordering::Acquire) {
                state::EMPTY => return Probe::Vacant(vacant.unwrap_or(idx)),
                state::TOMBSTONE => {
                    vacant.get_or_insert(idx);
                }
                _ => {
                    if slot.hash.load(Ordering::Relaxed) == hash && self.key_matches(slot, key) {
                        return Probe::Found(idx);
                    }
                }
            }
        }

        vacant.map_or(Probe::Full, Probe::Vacant)
    }

    fn key_matches(&self, slot: &Slot, key: &[u8]) -> bool {
        self.arena.eq(
            slot.key_offset.load(Ordering::Relaxed),
            slot.key_len.load(Ordering::Relaxed),
            key,
        )
    }

    fn block(&self, slot: &Slot) -> Block {
        self.arena.block_of(slot.key_offset.load(Ordering::Relaxed))
    }

    fn fill(&self, block: Block, key: &[u8], value: &[u8]) {
        self.arena.write(block.payload(), key);
        self.arena.write(block.payload() + key.len() as u64, value);
    }

    fn link(&self, slot: &Slot, block: Block, key_len: u64, value_len: u64) {
        slot.key_offset.store(block.payload(), Ordering::Relaxed);
        slot.key_len.store(key_len, Ordering::Relaxed);
        slot.value_offset.store(block.payload() + key_len, Ordering::Relaxed);
        slot.value_len.store(value_len, Ordering::Release);
    }
}

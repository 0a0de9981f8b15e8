//! A bounded hash map that lives in a memory mapped file and is shared by every process mapping
//! that file.
//!
//! ```no_run
//! # fn main() -> Result<(), shm_map::Error> {
//! let mut store = shm_map::Store::init(10_000, 10_000_000, "data.seg", None)?;
//! assert_eq!(store.put(b"abcd", b"1234")?, None);
//! assert_eq!(store.get(b"abcd")?.as_deref(), Some(&b"1234"[..]));
//! assert!(!store.contains(b"abc")?);
//! # Ok(()) }
//! ```
//!
//! ## Format
//!
//! The capacities, `max_entries` slots and `max_bytes` of key and value storage, are fixed when
//! the file is created. They are part of the format: opening a file with different capacities,
//! or a file of another format version, fails with [`Error::Format`]. Nothing is ever resized or
//! rehashed. Deleting the file is the only way to get rid of a segment.
//!
//! ## Concurrency
//!
//! Every handle opens the file itself and synchronizes through `flock(2)` on it. Mutations take
//! the exclusive lock, reads the shared one. The kernel releases the locks of a process that
//! dies; should that happen in the middle of a mutation, the next writer repairs the header
//! counters and reports it to its log sink. Locking blocks without timeout.
//!
//! A [`Store`] is `Send` but not `Sync`. Open one handle per thread instead of sharing one.
//!
//! ## shm-map is not a database
//!
//! Writes go to the shared mapping, the page cache decides when they reach the disk. A system
//! crash may lose or tear recent writes. The data survives the exit or crash of any process.
mod arena;
mod error;
mod layout;
mod lock;
mod segment;
mod sink;
mod table;

#[cfg(test)]
mod tests;

pub use arena::{FreeListClass, MemoryInfo};
pub use error::{Capacity, Error, Result};
pub use layout::{Layout, VERSION};
pub use sink::{Level, LogSink, StdoutSink};
pub use table::{hash, Info};

use std::path::Path;

use segment::Segment;
use sink::{BoxedSink, Diagnostics};

/// The number of slots used by [`StoreOptions`] unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;
/// The arena size used by [`StoreOptions`] unless configured otherwise.
pub const DEFAULT_MAX_BYTES: u64 = 10_000_000;

/// A handle to a shared segment.
///
/// Owns the mapping and the file descriptor, both are released on drop.
pub struct Store {
    segment: Segment,
    diag: Diagnostics,
}

/// Configuration for opening a [`Store`].
pub struct StoreOptions {
    max_entries: u64,
    max_bytes: u64,
    sink: Option<BoxedSink>,
}

impl Store {
    /// Open the store at `path`, creating the segment if the file does not exist.
    ///
    /// `sink` receives diagnostics for the lifetime of this handle.
    pub fn init(
        max_entries: u64,
        max_bytes: u64,
        path: impl AsRef<Path>,
        sink: Option<Box<dyn LogSink + Send>>,
    ) -> Result<Self> {
        StoreOptions {
            max_entries,
            max_bytes,
            sink,
        }
        .open(path)
    }

    pub fn options() -> StoreOptions {
        StoreOptions::default()
    }

    /// Insert `value` under `key`.
    ///
    /// Returns the value that was replaced, `None` if the key is new. On error nothing changed.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.segment.write(&self.diag)?;
        let table = guard.table();

        let before = table.info();
        let top_before = table.arena().top();

        match table.put(key, value) {
            Ok(previous) => {
                tracing::debug!(
                    key_len = key.len(),
                    value_len = value.len(),
                    replaced = previous.is_some(),
                    "put"
                );

                let after = table.info();
                self.warn_near_capacity(&before, &after, top_before, table.arena().top());
                Ok(previous)
            }
            Err(capacity) => {
                self.diag.error(format_args!(
                    "put of {} key and {} value bytes rejected: {capacity}",
                    key.len(),
                    value.len(),
                ));
                Err(Error::Capacity(capacity))
            }
        }
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.segment.read()?;
        Ok(guard.table().get(key))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let guard = self.segment.read()?;
        Ok(guard.table().contains(key))
    }

    /// Delete `key`, returning its value.
    ///
    /// The slot becomes a tombstone and the arena block goes back to its free list.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.segment.write(&self.diag)?;
        let removed = guard.table().remove(key);
        tracing::debug!(key_len = key.len(), removed = removed.is_some(), "remove");
        Ok(removed)
    }

    /// Call `visit` for every entry, in slot order.
    ///
    /// Holds the shared lock for the whole iteration, writers of other handles wait until it
    /// completes. Reading through this handle from within `visit` is fine.
    pub fn iter(&self, visit: impl FnMut(&[u8], &[u8])) -> Result<()> {
        let guard = self.segment.read()?;
        guard.table().for_each(visit);
        Ok(())
    }

    pub fn info(&self) -> Result<Info> {
        let guard = self.segment.read()?;
        Ok(guard.table().info())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u64> {
        Ok(self.info()?.entry_count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Detailed usage of the arena.
    pub fn memory_info(&self) -> Result<MemoryInfo> {
        let guard = self.segment.read()?;
        Ok(guard.table().arena().memory_info())
    }

    /// The non-empty free lists of the arena.
    pub fn free_list_info(&self) -> Result<Vec<FreeListClass>> {
        let guard = self.segment.read()?;
        Ok(guard.table().arena().free_list_info())
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn layout(&self) -> &Layout {
        self.segment.layout()
    }

    /// Unmap and close. The segment itself stays in place for the next `init`.
    pub fn close(self) {
        self.diag
            .emit(Level::Debug, format_args!("detached {}", self.path().display()));
    }

    fn warn_near_capacity(&self, before: &Info, after: &Info, top_before: u64, top_after: u64) {
        if crosses_threshold(before.entry_count, after.entry_count, after.max_entries) {
            self.diag.warn(format_args!(
                "{} holds {} of {} entries, new keys will soon be rejected",
                self.path().display(),
                after.entry_count,
                after.max_entries,
            ));
        }

        if crosses_threshold(before.bytes_used, after.bytes_used, after.max_bytes) {
            self.diag.warn(format_args!(
                "{} uses {} of {} arena bytes for live entries",
                self.path().display(),
                after.bytes_used,
                after.max_bytes,
            ));
        }

        if crosses_threshold(top_before, top_after, after.max_bytes) {
            self.diag.warn(format_args!(
                "{} has only {} arena bytes left that were never allocated",
                self.path().display(),
                after.max_bytes - top_after,
            ));
        }
    }
}

impl StoreOptions {
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Deliver diagnostics to `sink`.
    pub fn log_sink(mut self, sink: impl LogSink + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Store> {
        let diag = Diagnostics::new(self.sink);
        let path = path.as_ref();

        let layout = match Layout::new(self.max_entries, self.max_bytes) {
            Ok(layout) => layout,
            Err(err) => {
                diag.error(format_args!("can not open {}: {err}", path.display()));
                return Err(err);
            }
        };

        match Segment::open(path, layout, &diag) {
            Ok(segment) => Ok(Store { segment, diag }),
            Err(err) => {
                diag.error(format_args!("{err}"));
                Err(err)
            }
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
            sink: None,
        }
    }
}

/// Whether `before -> after` crossed 90% of `max`.
fn crosses_threshold(before: u64, after: u64, max: u64) -> bool {
    let limit = max - max / 10;
    before < limit && after >= limit
}

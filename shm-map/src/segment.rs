//! Creating, validating and mapping the backing file.
use core::cell::Cell;
use core::sync::atomic::{AtomicU8, Ordering};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};
use crate::layout::{HeaderPage, Layout, Slot, MAGIC, NIL, VERSION};
use crate::lock::{FlockGuard, Mode};
use crate::sink::Diagnostics;
use crate::table::Table;

/// Permissions of a newly created backing file, before the umask.
const FILE_MODE: u32 = 0o644;
/// Bytes of the header identifying a segment: magic, version, and both capacities.
const PREFIX_LEN: usize = 24;

/// A mapped segment, validated against the layout it was opened with.
pub(crate) struct Segment {
    view: SegmentView,
    /// The memory map backing `view`. This is purely for safety, not accessing the field besides
    /// `Drop`. Must be declared after `view`.
    #[allow(dead_code)]
    map: MmapRaw,
    /// Carries the `flock`, closing it releases any lock we hold.
    file: File,
    /// Number of live `ReadGuard`s of this handle, only the outermost one holds the `flock`.
    readers: Cell<u32>,
    path: PathBuf,
    layout: Layout,
}

/// Resolved references _into_ the memory map.
///
/// # Safety
///
/// The `'static` lifetimes are a lie, the true lifetime is that of the `MmapRaw` in the owning
/// `Segment`. Never hand them out unchanged; every accessor reborrows them from `&self`.
struct SegmentView {
    header: &'static HeaderPage,
    slots: &'static [Slot],
    arena: &'static [AtomicU8],
}

/// What we found in a file before mapping it.
enum Existing {
    /// Nothing, or an interrupted creation. Needs to be initialized.
    Fresh,
    /// A complete segment of our layout.
    Initialized,
}

/// Shared access to the table. Other readers may hold one concurrently, writers can not.
///
/// Read guards of one handle nest, e.g. a `get` from within an `iter` callback. `flock` does not
/// count, so only the outermost guard acquires and releases the lock.
pub(crate) struct ReadGuard<'lt> {
    table: Table<'lt>,
    readers: &'lt Cell<u32>,
    _lock: Option<FlockGuard<'lt>>,
}

/// Exclusive access to the table, across all processes.
pub(crate) struct WriteGuard<'lt> {
    table: Table<'lt>,
    header: &'lt HeaderPage,
    _lock: FlockGuard<'lt>,
}

impl Segment {
    /// Open the segment at `path`, creating it if it does not exist yet.
    pub(crate) fn open(path: &Path, layout: Layout, diag: &Diagnostics) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(FILE_MODE)
            .open(path)
            .map_err(|err| Error::io(path, err))?;

        // Serializes creation against other processes opening the same path.
        let init_lock = FlockGuard::acquire(&file, Mode::Exclusive).map_err(Error::Lock)?;

        let existing = inspect(&file, path, &layout)?;
        if let Existing::Fresh = existing {
            let len = file.metadata().map_err(|err| Error::io(path, err))?.len();
            if len < layout.file_len as u64 {
                file.set_len(layout.file_len as u64)
                    .map_err(|err| Error::io(path, err))?;
            }
        }

        let map = MmapOptions::new()
            .len(layout.file_len)
            .map_raw(&file)
            .map_err(|err| Error::io(path, err))?;

        // Safety: the map is `file_len` bytes long and page aligned, `map_all_raw` requires
        // nothing more. It is kept alive by the returned `Segment`.
        let view = unsafe { SegmentView::map_all_raw(map.as_mut_ptr(), &layout) };

        match existing {
            Existing::Fresh => {
                view.initialize(&layout);
                diag.info(format_args!(
                    "created segment {} with {} entries and {} arena bytes ({} bytes in total)",
                    path.display(),
                    layout.max_entries,
                    layout.max_bytes,
                    layout.file_len,
                ));
            }
            Existing::Initialized => {
                view.claim(0, diag);
                let info = view.table().info();
                diag.info(format_args!(
                    "attached segment {} holding {} of {} entries, {} of {} arena bytes used",
                    path.display(),
                    info.entry_count,
                    info.max_entries,
                    info.bytes_used,
                    info.max_bytes,
                ));
            }
        }

        drop(init_lock);

        Ok(Segment {
            view,
            map,
            file,
            readers: Cell::new(0),
            path: path.to_owned(),
            layout,
        })
    }

    pub(crate) fn read(&self) -> Result<ReadGuard<'_>> {
        let lock = match self.readers.get() {
            0 => Some(FlockGuard::acquire(&self.file, Mode::Shared).map_err(Error::Lock)?),
            _ => None,
        };

        self.readers.set(self.readers.get() + 1);
        Ok(ReadGuard {
            table: self.view.table(),
            readers: &self.readers,
            _lock: lock,
        })
    }

    /// Lock the segment for mutation.
    ///
    /// Repairs the header counters first if the previous writer died while holding the lock.
    pub(crate) fn write(&self, diag: &Diagnostics) -> Result<WriteGuard<'_>> {
        let lock = FlockGuard::acquire(&self.file, Mode::Exclusive).map_err(Error::Lock)?;
        debug_assert_eq!(lock.mode(), Mode::Exclusive);

        self.view.claim(u64::from(std::process::id()), diag);

        Ok(WriteGuard {
            table: self.view.table(),
            header: self.view.header,
            _lock: lock,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }
}

impl SegmentView {
    /// Safety:
    ///
    /// Caller promises that `ptr` points to an 8-aligned mapping valid for `layout.file_len`
    /// bytes, which outlives the returned value.
    unsafe fn map_all_raw(ptr: *mut u8, layout: &Layout) -> Self {
        let header = ptr.add(layout.header_offset) as *const HeaderPage;
        let slots = ptr.add(layout.slot_table_offset) as *const Slot;
        let arena = ptr.add(layout.arena_offset) as *const AtomicU8;

        // The slot and arena lengths fit `usize`, `Layout::new` checked the products.
        //
        // The one scary part is the requirement of the pointee being initialized memory. We
        // assume that this is the case for all memory mapped files, the kernel fills pages of a
        // file beyond its data with zeros.
        SegmentView {
            header: &*header,
            slots: &*core::ptr::slice_from_raw_parts(slots, layout.max_entries as usize),
            arena: &*core::ptr::slice_from_raw_parts(arena, layout.max_bytes as usize),
        }
    }

    fn table(&self) -> Table<'_> {
        Table::new(self.header, self.slots, self.arena)
    }

    /// Write an empty segment. The magic comes last so an interrupted creation is retried.
    fn initialize(&self, layout: &Layout) {
        let header = self.header;
        header.version.store(VERSION, Ordering::Relaxed);
        header.max_entries.store(layout.max_entries, Ordering::Relaxed);
        header.max_bytes.store(layout.max_bytes, Ordering::Relaxed);
        header.entry_count.store(0, Ordering::Relaxed);
        header.bytes_used.store(0, Ordering::Relaxed);
        header.arena_top.store(0, Ordering::Relaxed);
        header.lock_state.store(0, Ordering::Relaxed);

        for head in &header.free_heads {
            head.store(NIL, Ordering::Relaxed);
        }

        for slot in self.slots {
            for field in [
                &slot.state,
                &slot.hash,
                &slot.key_offset,
                &slot.key_len,
                &slot.value_offset,
                &slot.value_len,
            ] {
                field.store(0, Ordering::Relaxed);
            }
        }

        header.magic.store(MAGIC, Ordering::SeqCst);
    }

    /// Record `owner` as the writer, repairing the counters of an abandoned mutation.
    ///
    /// Must only be called with the exclusive lock held. Any previous owner that is still
    /// recorded can not hold the lock anymore, it died before it could clear the record.
    fn claim(&self, owner: u64, diag: &Diagnostics) {
        let previous = self.header.lock_state.swap(owner, Ordering::SeqCst);
        if previous == 0 {
            return;
        }

        let (entries, bytes) = self.table().recount();
        let info = self.table().info();
        diag.warn(format_args!(
            "writer pid {previous} died while holding the segment lock; \
             recounted entries {entries} -> {}, bytes used {bytes} -> {}",
            info.entry_count, info.bytes_used,
        ));
    }
}

/// Decide whether the file at `path` holds a segment compatible with `layout`.
///
/// Mismatches are errors; we never reinterpret or resize an existing segment.
fn inspect(file: &File, path: &Path, layout: &Layout) -> Result<Existing> {
    let len = file.metadata().map_err(|err| Error::io(path, err))?.len();

    // A short file is compared by the bytes it has, the rest reads as zero.
    let mut prefix = [0u8; PREFIX_LEN];
    let available = len.min(PREFIX_LEN as u64) as usize;
    file.read_exact_at(&mut prefix[..available], 0)
        .map_err(|err| Error::io(path, err))?;

    let magic = u32::from_ne_bytes(field(&prefix, 0));
    let version = u32::from_ne_bytes(field(&prefix, 4));
    let max_entries = u64::from_ne_bytes(field(&prefix, 8));
    let max_bytes = u64::from_ne_bytes(field(&prefix, 16));

    let same_config = version == VERSION
        && max_entries == layout.max_entries
        && max_bytes == layout.max_bytes;

    if magic == 0 {
        // Either empty, or we crashed creating it with the same configuration.
        if prefix.iter().all(|&b| b == 0) || same_config {
            return Ok(Existing::Fresh);
        }

        return Err(Error::format(path, "not a segment, refusing to overwrite it"));
    }

    if magic != MAGIC {
        return Err(Error::format(path, format!("unknown magic {magic:#010x}")));
    }

    if version != VERSION {
        return Err(Error::format(
            path,
            format!("format version {version} is not supported, expected {VERSION}"),
        ));
    }

    if !same_config {
        return Err(Error::format(
            path,
            format!(
                "created for {max_entries} entries and {max_bytes} bytes, \
                 opened for {} entries and {} bytes",
                layout.max_entries, layout.max_bytes,
            ),
        ));
    }

    if len < layout.file_len as u64 {
        return Err(Error::format(
            path,
            format!("truncated to {len} bytes, expected {}", layout.file_len),
        ));
    }

    Ok(Existing::Initialized)
}

fn field<const N: usize>(prefix: &[u8; PREFIX_LEN], at: usize) -> [u8; N] {
    let mut bytes = [0; N];
    bytes.copy_from_slice(&prefix[at..at + N]);
    bytes
}

impl<'lt> ReadGuard<'lt> {
    pub(crate) fn table(&self) -> &Table<'lt> {
        &self.table
    }
}

impl<'lt> WriteGuard<'lt> {
    pub(crate) fn table(&self) -> &Table<'lt> {
        &self.table
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.readers.set(self.readers.get() - 1);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // Sequenced before the unlock, which happens when `_lock` is dropped after this.
        self.header.lock_state.store(0, Ordering::SeqCst);
    }
}

const _: () = assert!(core::mem::offset_of!(HeaderPage, magic) == 0);
const _: () = assert!(core::mem::offset_of!(HeaderPage, version) == 4);
const _: () = assert!(core::mem::offset_of!(HeaderPage, max_entries) == 8);
const _: () = assert!(core::mem::offset_of!(HeaderPage, max_bytes) == 16);

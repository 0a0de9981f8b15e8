use crate::layout::{HeaderPage, VERSION};
use crate::{Capacity, Error, Info, Level, LogSink, Store};

use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

type Messages = Arc<Mutex<Vec<(Level, String)>>>;

fn with_setup(method: impl FnOnce(&Path)) {
    let dir = tempfile::tempdir().expect("to create a scratch directory");
    method(&dir.path().join("data.seg"))
}

fn open_logged(path: &Path, max_entries: u64, max_bytes: u64) -> (Store, Messages) {
    let messages = Messages::default();
    let collect = messages.clone();

    let store = Store::options()
        .max_entries(max_entries)
        .max_bytes(max_bytes)
        .log_sink(move |level: Level, msg: &str| {
            collect.lock().unwrap().push((level, msg.to_owned()));
        })
        .open(path)
        .unwrap();

    (store, messages)
}

fn count(messages: &Messages, level: Level, needle: &str) -> usize {
    messages
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, msg)| *l == level && msg.contains(needle))
        .count()
}

#[test]
fn host_scenario() {
    with_setup(|path| {
        let mut store = Store::init(10000, 10000000, path, None).unwrap();

        assert_eq!(store.put(b"abcd", b"1234").unwrap(), None);
        assert_eq!(store.get(b"abc").unwrap(), None);
        assert!(!store.contains(b"abc").unwrap());
        assert!(!store.contains(b"1abc").unwrap());
        assert_eq!(store.put(b"abc", b"123456").unwrap(), None);
        assert_eq!(store.get(b"abc").unwrap().as_deref(), Some(&b"123456"[..]));

        let info = store.info().unwrap();
        assert_eq!(info.entry_count, 2);
        assert_eq!(info.max_entries, 10000);
        assert_eq!(info.max_bytes, 10000000);
    });
}

#[test]
fn unique_keys_are_counted() {
    with_setup(|path| {
        let mut store = Store::init(64, 1 << 16, path, None).unwrap();
        let mut expected = BTreeMap::new();

        for i in 0..64u32 {
            let key = format!("key-{i}").into_bytes();
            let value = i.to_le_bytes().repeat(i as usize % 7);
            assert_eq!(store.put(&key, &value).unwrap(), None);
            expected.insert(key, value);
        }

        // Overwrite a third of them, with differently sized values.
        for i in (0..64u32).step_by(3) {
            let key = format!("key-{i}").into_bytes();
            let value = vec![b'x'; i as usize];
            let previous = store.put(&key, &value).unwrap();
            assert_eq!(previous.as_ref(), expected.get(&key));
            expected.insert(key, value);
        }

        assert_eq!(store.len().unwrap(), 64);
        for (key, value) in &expected {
            assert_eq!(store.get(key).unwrap().as_ref(), Some(value));
        }

        let mut seen = BTreeMap::new();
        store
            .iter(|k, v| {
                assert!(seen.insert(k.to_vec(), v.to_vec()).is_none(), "visited twice");
            })
            .unwrap();
        assert_eq!(seen, expected);
    });
}

#[test]
fn full_table_rejects_without_change() {
    with_setup(|path| {
        let (mut store, messages) = open_logged(path, 10, 4096);

        for i in 0..10u8 {
            store.put(&[i], b"v").unwrap();
        }

        let before = store.info().unwrap();
        let memory = store.memory_info().unwrap();
        let err = store.put(b"one too many", b"v").unwrap_err();

        assert!(matches!(err, Error::Capacity(Capacity::Entries { max_entries: 10 })));
        assert_eq!(store.info().unwrap(), before);
        assert_eq!(store.memory_info().unwrap(), memory);

        // Replacing still works.
        assert_eq!(store.put(&[3], b"w").unwrap().as_deref(), Some(&b"v"[..]));

        // Warned at 9 of 10, then reported the failure.
        assert_eq!(count(&messages, Level::Warn, "9 of 10 entries"), 1);
        assert_eq!(count(&messages, Level::Error, "table is full"), 1);
    });
}

#[test]
fn arena_exhaustion_is_reported() {
    with_setup(|path| {
        let (mut store, messages) = open_logged(path, 16, 256);

        store.put(b"a", &[1; 100]).unwrap();
        let before = store.info().unwrap();

        let err = store.put(b"b", &[2; 200]).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(store.info().unwrap(), before);
        assert_eq!(count(&messages, Level::Error, "arena can not fit"), 1);

        // Removing frees the block for the same size class.
        assert_eq!(store.remove(b"a").unwrap().as_deref(), Some(&[1; 100][..]));
        assert_eq!(store.info().unwrap().bytes_used, 0);
        store.put(b"c", &[3; 100]).unwrap();
        assert_eq!(store.memory_info().unwrap().allocated_area_size, 16 + 104);
    });
}

#[test]
fn two_handles_share_writes() {
    with_setup(|path| {
        let mut a = Store::init(100, 4096, path, None).unwrap();
        let mut b = Store::init(100, 4096, path, None).unwrap();

        a.put(b"x", b"1").unwrap();
        assert_eq!(b.get(b"x").unwrap().as_deref(), Some(&b"1"[..]));

        assert_eq!(b.put(b"x", b"2").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(a.get(b"x").unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(a.info().unwrap(), b.info().unwrap());
    });
}

#[test]
fn reattach_preserves_entries() {
    with_setup(|path| {
        let (mut store, messages) = open_logged(path, 100, 4096);
        assert_eq!(count(&messages, Level::Info, "created segment"), 1);

        store.put(b"persistent", b"yes").unwrap();
        store.put(b"removed", b"soon").unwrap();
        store.remove(b"removed").unwrap();
        let info = store.info().unwrap();
        store.close();

        let (store, messages) = open_logged(path, 100, 4096);
        assert_eq!(count(&messages, Level::Info, "attached segment"), 1);
        assert_eq!(store.info().unwrap(), info);
        assert_eq!(store.get(b"persistent").unwrap().as_deref(), Some(&b"yes"[..]));
        assert!(!store.contains(b"removed").unwrap());
    });
}

#[test]
fn mismatched_capacity_is_rejected() {
    with_setup(|path| {
        drop(Store::init(100, 4096, path, None).unwrap());

        let err = Store::init(101, 4096, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");
        let err = Store::init(100, 4095, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");

        Store::init(100, 4096, path, None).unwrap();
    });
}

#[test]
fn foreign_and_future_files_are_rejected() {
    with_setup(|path| {
        std::fs::write(path, b"definitely not a segment, but some text file").unwrap();
        let err = Store::init(10, 100, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");
        // And it was left alone.
        assert_eq!(
            std::fs::read(path).unwrap(),
            b"definitely not a segment, but some text file"
        );

        std::fs::write(path, b"tiny").unwrap();
        let err = Store::init(10, 100, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");
        assert_eq!(std::fs::read(path).unwrap(), b"tiny");

        std::fs::remove_file(path).unwrap();
        drop(Store::init(10, 100, path, None).unwrap());

        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        let at = core::mem::offset_of!(HeaderPage, version) as u64;
        file.write_all_at(&(VERSION + 1).to_ne_bytes(), at).unwrap();

        let err = Store::init(10, 100, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");
    });
}

#[test]
fn truncated_file_is_rejected() {
    with_setup(|path| {
        let store = Store::init(10, 100, path, None).unwrap();
        let len = store.layout().file_len as u64;
        drop(store);

        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(len - 1).unwrap();

        let err = Store::init(10, 100, path, None).err().unwrap();
        assert!(matches!(err, Error::Format { .. }), "{err}");
    });
}

#[test]
fn zero_capacity_is_a_config_error() {
    with_setup(|path| {
        let messages = Messages::default();
        let collect = messages.clone();
        let sink: Box<dyn LogSink + Send> = Box::new(move |level: Level, msg: &str| {
            collect.lock().unwrap().push((level, msg.to_owned()));
        });

        let err = Store::init(0, 100, path, Some(sink)).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(matches!(Store::init(10, 0, path, None), Err(Error::Config(_))));
        assert!(!path.exists());
        assert_eq!(count(&messages, Level::Error, "max_entries"), 1);
    });
}

#[test]
fn abandoned_writer_is_repaired() {
    with_setup(|path| {
        let mut store = Store::init(10, 1024, path, None).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        let info = store.info().unwrap();

        // What a writer leaves behind when killed between slot and counter updates.
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        let lock_state = core::mem::offset_of!(HeaderPage, lock_state) as u64;
        let entry_count = core::mem::offset_of!(HeaderPage, entry_count) as u64;
        file.write_all_at(&4_000_000u64.to_ne_bytes(), lock_state).unwrap();
        file.write_all_at(&1u64.to_ne_bytes(), entry_count).unwrap();

        let (mut other, messages) = open_logged(path, 10, 1024);
        assert_eq!(count(&messages, Level::Warn, "pid 4000000 died"), 1);
        assert_eq!(other.info().unwrap(), info);

        // The record is cleared again, the next writer sees nothing suspicious.
        other.put(b"c", b"3").unwrap();
        assert_eq!(count(&messages, Level::Warn, "died"), 1);
        assert_eq!(store.len().unwrap(), 3);
    });
}

#[test]
fn reads_nest_inside_iteration() {
    with_setup(|path| {
        let mut store = Store::init(10, 1024, path, None).unwrap();
        store.put(b"a", b"b").unwrap();
        store.put(b"b", b"c").unwrap();

        let mut chained = vec![];
        store
            .iter(|_, v| chained.push(store.get(v).unwrap()))
            .unwrap();
        chained.sort();
        assert_eq!(chained, [None, Some(b"c".to_vec())]);

        // The shared lock is gone once the outermost reader is done.
        store.put(b"c", b"d").unwrap();
    });
}

#[test]
fn memory_report_tracks_free_lists() {
    with_setup(|path| {
        let mut store = Store::init(10, 1024, path, None).unwrap();
        store.put(b"k1", b"small").unwrap();
        store.put(b"k2", &[0; 300]).unwrap();
        store.remove(b"k1").unwrap();
        store.remove(b"k2").unwrap();

        let classes = store.free_list_info().unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!((classes[0].capacity, classes[0].blocks), (8, 1));
        assert_eq!((classes[1].capacity, classes[1].blocks), (304, 1));

        let memory = store.memory_info().unwrap();
        assert_eq!(memory.pool_size, 1024);
        assert_eq!(memory.real_used_size, 0);
        assert_eq!(memory.allocated_area_free_size, memory.allocated_area_size);
        assert_eq!(memory.free_area_size, 1024 - memory.allocated_area_size);
        assert!(store.is_empty().unwrap());

        assert_eq!(
            store.info().unwrap(),
            Info {
                entry_count: 0,
                bytes_used: 0,
                max_entries: 10,
                max_bytes: 1024,
            }
        );
    });
}

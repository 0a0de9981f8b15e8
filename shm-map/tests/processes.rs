#![cfg(target_family = "unix")]
use shm_map::Store;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Run `method` in a forked child and return its pid.
///
/// The child never returns into the test harness, it exits with `0` on success and `101` if
/// `method` panicked.
fn spawn(method: impl FnOnce()) -> libc::pid_t {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(method));
            let code = if result.is_ok() { 0 } else { 101 };
            unsafe { libc::_exit(code) }
        }
        pid => pid,
    }
}

/// Wait for the child, returning its exit code or `None` if it was killed by a signal.
fn wait(pid: libc::pid_t) -> Option<i32> {
    let mut status = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(ret, pid, "waitpid: {}", std::io::Error::last_os_error());

    if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    }
}

fn open(path: &Path) -> Store {
    Store::init(1000, 1 << 16, path, None).expect("to open the segment")
}

#[test]
fn child_writes_are_visible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.seg");
    let store = open(&path);

    let child = spawn(|| {
        let mut store = open(&path);
        assert_eq!(store.put(b"x", b"1").unwrap(), None);
    });

    assert_eq!(wait(child), Some(0));
    assert_eq!(store.get(b"x").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn concurrent_writers_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.seg");

    let children: Vec<_> = (0..4)
        .map(|id| {
            let path = &path;
            spawn(move || {
                let mut store = open(path);
                for i in 0..100 {
                    let key = format!("{id}/{i}");
                    store.put(key.as_bytes(), key.repeat(id + 1).as_bytes()).unwrap();
                }
            })
        })
        .collect();

    for child in children {
        assert_eq!(wait(child), Some(0));
    }

    let store = open(&path);
    assert_eq!(store.len().unwrap(), 400);

    for id in 0..4 {
        for i in 0..100 {
            let key = format!("{id}/{i}");
            let value = store.get(key.as_bytes()).unwrap();
            assert_eq!(value, Some(key.repeat(id + 1).into_bytes()));
        }
    }
}

#[test]
fn killed_writer_leaves_a_usable_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.seg");

    let child = spawn(|| {
        let mut store = open(&path);
        for round in 0usize.. {
            let key = format!("key-{}", round % 50);
            let value = vec![b'v'; round % 97];
            store.put(key.as_bytes(), &value).unwrap();

            if round % 7 == 0 {
                store.remove(key.as_bytes()).unwrap();
            }
        }
    });

    std::thread::sleep(Duration::from_millis(50));
    unsafe { libc::kill(child, libc::SIGKILL) };
    assert_eq!(wait(child), None);

    // The lock was released by the kernel; taking it for writing repairs whatever the child left.
    let mut store = open(&path);
    store.put(b"after", b"crash").unwrap();

    let mut entries = BTreeMap::new();
    store
        .iter(|k, v| {
            entries.insert(k.to_vec(), v.to_vec());
        })
        .unwrap();

    assert_eq!(store.len().unwrap(), entries.len() as u64);
    assert_eq!(entries.get(&b"after"[..]).map(Vec::as_slice), Some(&b"crash"[..]));
    for key in entries.keys() {
        assert!(store.contains(key).unwrap());
    }

    let memory = store.memory_info().unwrap();
    assert!(memory.real_used_size + memory.allocated_area_free_size <= memory.allocated_area_size);
}

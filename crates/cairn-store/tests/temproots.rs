//! The writer/collector handshake on temp-roots files.

mod common;

use std::fs::OpenOptions;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use cairn_store::fslock::{lock_file, unlock, LockMode};

use common::harness;

/// A writer that wants to append a temp root while the collector holds the
/// read lock on its file must block until the collector lets go, and the
/// entry must land in the file afterwards.
#[test]
fn append_blocks_while_the_collector_holds_the_read_lock() -> Result<()> {
    let h = harness()?;
    let first = h.store_path("abc-first");
    let second = h.store_path("abc-second");

    h.store.add_temp_root(&first)?;
    let roots_file = h
        .store
        .settings()
        .temp_roots_dir()
        .join(std::process::id().to_string());

    // Collector side: the owner is alive, so the non-blocking write probe
    // fails and a shared read lock is taken instead.
    let collector_fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&roots_file)?;
    assert!(!lock_file(&collector_fd, LockMode::Write, false)?);
    assert!(lock_file(&collector_fd, LockMode::Read, true)?);

    // Writer side: the upgrade to a write lock now has to wait.
    let store = h.store.clone();
    let pending = second.clone();
    let (tx, rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        let result = store.add_temp_root(&pending);
        tx.send(()).expect("main thread is waiting");
        result
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "the writer must not get past its write-lock upgrade"
    );

    unlock(&collector_fd)?;
    rx.recv_timeout(Duration::from_secs(10))
        .expect("the writer must finish once the collector releases");
    writer.join().expect("writer thread")?;

    // Both entries are on disk, NUL-terminated.
    let contents = std::fs::read(&roots_file)?;
    let segments: Vec<_> = contents
        .split(|byte| *byte == 0)
        .filter(|segment| !segment.is_empty())
        .collect();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0], first.as_os_str().as_encoded_bytes());
    assert_eq!(segments[1], second.as_os_str().as_encoded_bytes());
    Ok(())
}

/// The collection itself must observe roots added before it started and
/// keep protecting them for its whole duration.
#[test]
fn collection_sees_roots_added_before_it_started() -> Result<()> {
    let h = harness()?;
    let pinned = h.add_path("abc-pinned", &[])?;
    h.store.add_temp_root(&pinned)?;

    let results = h.store.collect_garbage(&cairn_store::GcOptions {
        action: cairn_store::GcAction::DeleteDead,
        ..cairn_store::GcOptions::default()
    })?;

    assert!(results.paths.is_empty());
    assert!(h.is_valid(&pinned));
    Ok(())
}

/// After an orderly shutdown the next collection treats the process's
/// paths as unprotected.
#[test]
fn dropping_the_temp_roots_releases_protection() -> Result<()> {
    let h = harness()?;
    let pinned = h.add_path("abc-pinned", &[])?;
    h.store.add_temp_root(&pinned)?;
    h.store.remove_temp_roots();

    h.store.collect_garbage(&cairn_store::GcOptions {
        action: cairn_store::GcAction::DeleteDead,
        ..cairn_store::GcOptions::default()
    })?;

    assert!(!h.is_valid(&pinned));
    Ok(())
}

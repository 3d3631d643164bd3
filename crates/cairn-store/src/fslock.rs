//! Advisory file locks.
//!
//! Whole-file read/write locks over an open [`File`], with blocking and
//! non-blocking acquisition. Ownership is tied to the open file description,
//! not the path: a second open of the same file by the same process is
//! independently lockable, which the temp-roots handshake depends on. Locks
//! are released explicitly with [`unlock`] or implicitly when the file is
//! closed.

use std::fs::File;
use std::io::{self, ErrorKind};

use fs4::FileExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Acquire a lock on `file` in the given mode.
///
/// Returns `Ok(false)` when `blocking` is false and the lock is contended;
/// blocking acquisition always returns `Ok(true)` once the lock is held.
/// Re-locking an already locked descriptor converts the lock, so the same
/// call serves to upgrade and downgrade.
pub fn lock_file(file: &File, mode: LockMode, blocking: bool) -> io::Result<bool> {
    let result = match (mode, blocking) {
        (LockMode::Read, true) => file.lock_shared(),
        (LockMode::Write, true) => file.lock_exclusive(),
        (LockMode::Read, false) => FileExt::try_lock_shared(file),
        (LockMode::Write, false) => FileExt::try_lock_exclusive(file),
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if !blocking && err.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(err),
    }
}

/// Release the lock held through `file`.
pub fn unlock(file: &File) -> io::Result<()> {
    file.unlock()
}

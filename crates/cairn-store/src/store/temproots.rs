//! Per-process temporary roots.
//!
//! Every process that builds or registers store paths keeps a file
//! `<state>/temproots/<pid>` of NUL-terminated store paths it must not lose,
//! held under a read lock for the process's lifetime. Appending requires
//! upgrading that lock to a write lock, which blocks while the collector
//! holds its own read lock on the file: a writer's intent to add a root
//! becomes visible to the collector as a pending write lock instead of as
//! content it might miss.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::LocalStore;
use crate::fslock::{lock_file, LockMode};

/// The open temp-roots file of this process. Dropping it releases the lock
/// and unlinks the file.
pub(super) struct TempRootsFile {
    path: PathBuf,
    file: File,
}

impl Drop for TempRootsFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl LocalStore {
    /// Record `path` as a temporary root of this process. The path stays
    /// protected until the store is dropped (or [`LocalStore::remove_temp_roots`]
    /// is called) and the process's read lock is released.
    pub fn add_temp_root(&self, path: &Path) -> Result<()> {
        let mut guard = self
            .temp_roots_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.open_temp_roots_file()?);
        }
        let temp_roots = guard.as_mut().expect("temp-roots file was just opened");

        // Blocks while the collector holds a read lock on our file.
        debug!(path = %temp_roots.path.display(), "acquiring write lock");
        lock_file(&temp_roots.file, LockMode::Write, true)
            .with_context(|| format!("failed to lock {}", temp_roots.path.display()))?;

        let mut record = path.as_os_str().as_bytes().to_vec();
        record.push(0);
        temp_roots
            .file
            .write_all(&record)
            .with_context(|| format!("failed to append to {}", temp_roots.path.display()))?;

        debug!(path = %temp_roots.path.display(), "downgrading to read lock");
        lock_file(&temp_roots.file, LockMode::Read, true)
            .with_context(|| format!("failed to lock {}", temp_roots.path.display()))?;
        Ok(())
    }

    fn open_temp_roots_file(&self) -> Result<TempRootsFile> {
        loop {
            let dir = self.settings.temp_roots_dir();
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
            let path = dir.join(std::process::id().to_string());

            // New temp-roots files must not appear while a collection holds
            // the global lock.
            let gc_lock = self.open_gc_lock(LockMode::Read)?;

            if fs::symlink_metadata(&path).is_ok() {
                // Pids are unique among live processes, so a leftover file
                // with ours must be stale.
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale {}", path.display()))?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o600)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;

            drop(gc_lock);

            debug!(path = %path.display(), "acquiring read lock");
            lock_file(&file, LockMode::Read, true)
                .with_context(|| format!("failed to lock {}", path.display()))?;

            // A collector that raced us between open and lock has unlinked
            // the file and left a marker byte behind; start over.
            let size = file
                .metadata()
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            if size == 0 {
                return Ok(TempRootsFile { path, file });
            }
        }
    }

    /// Collector side: read every per-process temp-roots file, removing the
    /// stale ones, and keep a read lock on each live one (returned in `fds`)
    /// so that no owner can append until the collection ends.
    pub(super) fn read_temp_roots(
        &self,
        temp_roots: &mut BTreeSet<PathBuf>,
        fds: &mut Vec<File>,
    ) -> Result<()> {
        let dir = self.settings.temp_roots_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()))
            }
        };

        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry of {}", dir.display()))?;
            self.check_interrupt()?;
            let path = entry.path();
            debug!(path = %path.display(), "reading temporary roots file");

            let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                // The owner exited in between; nothing to protect.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to open {}", path.display()))
                }
            };

            // A write lock can only be acquired if the owning process is
            // gone, in which case its roots no longer matter. The marker
            // byte makes the removal observable to an owner that re-created
            // the file and is still waiting for its first lock.
            if lock_file(&file, LockMode::Write, false)
                .with_context(|| format!("failed to lock {}", path.display()))?
            {
                warn!(path = %path.display(), "removing stale temporary roots file");
                let _ = fs::remove_file(&path);
                let _ = file.write_all(b"d");
                continue;
            }

            // Compatible with the owner's read lock, and forces an owner
            // that is mid-upgrade to wait for us.
            debug!(path = %path.display(), "waiting for read lock");
            lock_file(&file, LockMode::Read, true)
                .with_context(|| format!("failed to lock {}", path.display()))?;

            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .with_context(|| format!("failed to read {}", path.display()))?;

            for segment in contents.split(|byte| *byte == 0) {
                if segment.is_empty() {
                    continue;
                }
                let root = PathBuf::from(std::ffi::OsString::from_vec(segment.to_vec()));
                debug!(root = %root.display(), "got temporary root");
                self.settings.assert_store_path(&root)?;
                temp_roots.insert(root);
            }

            // Keep the descriptor (and with it the read lock) alive until
            // the collection ends.
            fds.push(file);
        }
        Ok(())
    }
}

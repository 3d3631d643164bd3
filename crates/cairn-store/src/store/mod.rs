//! The local store: root management and garbage collection.
//!
//! Coordination between the collector and concurrent store writers is
//! entirely through advisory file locks. The global lock `<state>/gc.lock`
//! is held in write mode for the duration of a collection and taken briefly
//! in read mode by writers committing new roots; per-process temp-roots
//! files carry their own lock handshake (see [`temproots`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use cairn_catalog::Catalog;

use crate::fslock::{lock_file, LockMode};
use crate::settings::Settings;

mod gc;
mod roots;
mod temproots;


use temproots::TempRootsFile;

/// Typed policy failures of the store engine. Syscall-level failures travel
/// as `std::io::Error` inside the `anyhow` chain.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("path {path} is not in the store")]
    NotInStore { path: String },
    #[error("path {path} is not a store path")]
    NotAStorePath { path: String },
    #[error("creating a garbage collector root ({link}) inside the store is forbidden")]
    RootInsideStore { link: String },
    #[error("cannot create symlink {link}: it already exists and does not point into the store")]
    RootLinkExists { link: String },
    #[error("path {link} is not a valid garbage collector root; it is not under {roots_dir}")]
    RootOutsideRootsDir { link: String, roots_dir: String },
    #[error("cannot delete path {path} since it is still alive")]
    PathStillAlive { path: String },
    #[error("interrupted")]
    Interrupted,
}

/// What a collection should do with the paths it classifies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcAction {
    /// Report the live paths, delete nothing.
    ReturnLive,
    /// Report the dead paths, delete nothing.
    ReturnDead,
    /// Delete everything unreachable from the roots.
    DeleteDead,
    /// Delete exactly the requested paths, failing if any is alive.
    DeleteSpecific,
}

#[derive(Clone, Debug)]
pub struct GcOptions {
    pub action: GcAction,
    /// The paths to delete under [`GcAction::DeleteSpecific`].
    pub paths_to_delete: BTreeSet<PathBuf>,
    /// Stop once this many bytes have been deleted or invalidated. Zero
    /// disables the store scan altogether; `DeleteSpecific` ignores it.
    pub max_freed: u64,
    /// Skip root discovery and treat every path as unreferenced.
    pub ignore_liveness: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            paths_to_delete: BTreeSet::new(),
            max_freed: u64::MAX,
            ignore_liveness: false,
        }
    }
}

/// Outcome of a collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcResults {
    /// The dead paths (or, for [`GcAction::ReturnLive`], the live ones).
    pub paths: BTreeSet<PathBuf>,
    pub bytes_freed: u64,
}

/// Map from each discovered root link to the store path it resolves to.
pub type Roots = BTreeMap<PathBuf, PathBuf>;

/// A local store rooted at [`Settings::store_dir`], with validity tracked by
/// an external [`Catalog`].
pub struct LocalStore {
    settings: Settings,
    catalog: Arc<dyn Catalog>,
    /// This process's temp-roots file, opened lazily on the first
    /// `add_temp_root` and unlinked when the store is dropped.
    temp_roots_file: Mutex<Option<TempRootsFile>>,
    interrupted: Arc<AtomicBool>,
}

impl LocalStore {
    pub fn new(settings: Settings, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            settings,
            catalog,
            temp_roots_file: Mutex::new(None),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// Shared flag that aborts an in-flight collection when set. The
    /// collector polls it at every directory entry and every liveness
    /// decision and unwinds with all locks released.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub(crate) fn check_interrupt(&self) -> Result<()> {
        if self.interrupted.load(Ordering::Relaxed) {
            return Err(StoreError::Interrupted.into());
        }
        Ok(())
    }

    /// Acquire the global GC lock. Taken in write mode for the duration of a
    /// collection; taken in read mode by processes that must not race past
    /// one (committing a root, opening a temp-roots file).
    pub(crate) fn open_gc_lock(&self, mode: LockMode) -> Result<File> {
        let lock_path = self.settings.gc_lock_file();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        debug!(path = %lock_path.display(), "acquiring global GC lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)
            .with_context(|| format!("failed to open GC lock {}", lock_path.display()))?;
        if !lock_file(&file, mode, false)
            .with_context(|| format!("failed to lock {}", lock_path.display()))?
        {
            warn!("waiting for the big garbage collector lock...");
            lock_file(&file, mode, true)
                .with_context(|| format!("failed to lock {}", lock_path.display()))?;
        }
        Ok(file)
    }

    /// Block until no collection is in progress, then return immediately.
    ///
    /// A writer calls this after committing a new root: any collector that
    /// acquired the GC lock before the commit finishes first, and any that
    /// starts later observes the root.
    pub fn sync_with_gc(&self) -> Result<()> {
        let _gc_lock = self.open_gc_lock(LockMode::Read)?;
        Ok(())
    }

    /// Unlink this process's temp-roots file. Done implicitly when the store
    /// is dropped; exposed for orderly early shutdown.
    pub fn remove_temp_roots(&self) {
        let mut guard = self
            .temp_roots_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}

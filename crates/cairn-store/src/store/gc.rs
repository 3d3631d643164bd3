//! The collector: liveness over the reference graph and deletion.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::{debug, info};

use cairn_catalog::{is_derivation, topo_sort_paths};

use super::{GcAction, GcOptions, GcResults, LocalStore, StoreError};
use crate::fslock::LockMode;
use crate::fsutil::{delete_path, make_writable};

/// Stops the store scan once the byte budget is exhausted. Caught at the
/// top of `collect_garbage`; never surfaced to callers.
#[derive(Debug, thiserror::Error)]
#[error("deletion byte budget exhausted")]
struct LimitReached;

struct GcState {
    action: GcAction,
    max_freed: u64,
    keep_outputs: bool,
    keep_derivations: bool,
    roots: BTreeSet<PathBuf>,
    temp_roots: BTreeSet<PathBuf>,
    deleted: BTreeSet<PathBuf>,
    live: BTreeSet<PathBuf>,
    /// Valid directories renamed aside under the lock, awaiting removal
    /// after it is released.
    invalidated: BTreeSet<PathBuf>,
    bytes_invalidated: u64,
    results: GcResults,
}

fn should_delete(action: GcAction) -> bool {
    matches!(action, GcAction::DeleteDead | GcAction::DeleteSpecific)
}

impl LocalStore {
    /// Run one collection with the given options and return what it decided
    /// (and, for the deleting actions, performed).
    pub fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults> {
        let mut state = GcState {
            action: options.action,
            // The byte budget only applies to the store scan.
            max_freed: if options.action == GcAction::DeleteSpecific {
                u64::MAX
            } else {
                options.max_freed
            },
            keep_outputs: self.settings.keep_outputs,
            keep_derivations: self.settings.keep_derivations,
            roots: BTreeSet::new(),
            temp_roots: BTreeSet::new(),
            deleted: BTreeSet::new(),
            live: BTreeSet::new(),
            invalidated: BTreeSet::new(),
            bytes_invalidated: 0,
            results: GcResults::default(),
        };

        // Deleting specific paths while ignoring liveness must not recurse
        // into their outputs or derivers.
        if options.action == GcAction::DeleteSpecific && options.ignore_liveness {
            state.keep_outputs = false;
            state.keep_derivations = false;
        }

        // Holding the lock in write mode keeps new permanent roots and new
        // temp-roots files out until the collection is over.
        let gc_lock = self.open_gc_lock(LockMode::Write)?;

        info!("finding garbage collector roots...");
        if !options.ignore_liveness {
            // The set of permanent roots cannot grow from here on.
            let root_map = self.find_roots_impl(true)?;
            state.roots.extend(root_map.into_values());
            self.add_additional_roots(&mut state.roots)?;
        }

        // Takes read locks on all per-process files; no temporary root can
        // be added past this point.
        let mut fds = Vec::new();
        self.read_temp_roots(&mut state.temp_roots, &mut fds)?;
        state.roots.extend(state.temp_roots.iter().cloned());

        if options.action == GcAction::DeleteSpecific {
            for path in &options.paths_to_delete {
                self.settings.assert_store_path(path)?;
                if !self.try_to_delete(&mut state, path)? {
                    return Err(StoreError::PathStillAlive {
                        path: path.display().to_string(),
                    }
                    .into());
                }
            }
        } else if options.max_freed > 0 {
            if should_delete(state.action) {
                info!("deleting garbage...");
            } else {
                info!("determining live/dead paths...");
            }

            let mut scan = || -> Result<()> {
                // Invalid entries are deleted while the directory is still
                // being streamed: they can never become live again, which
                // makes them the preferred targets under a byte budget.
                let store_dir = self.settings.store_dir.clone();
                let mut entries = Vec::new();
                for entry in fs::read_dir(&store_dir)
                    .with_context(|| format!("failed to read {}", store_dir.display()))?
                {
                    let entry = entry
                        .with_context(|| format!("failed to read entry of {}", store_dir.display()))?;
                    self.check_interrupt()?;
                    let path = entry.path();
                    if self.catalog.is_valid_path(&path)? {
                        entries.push(path);
                    } else {
                        self.try_to_delete(&mut state, &path)?;
                    }
                }

                // Shuffle the remaining valid entries so a budgeted run is
                // not biased toward names that sort first.
                entries.shuffle(&mut thread_rng());
                for path in &entries {
                    self.try_to_delete(&mut state, path)?;
                }
                Ok(())
            };
            if let Err(err) = scan() {
                if err.downcast_ref::<LimitReached>().is_none() {
                    return Err(err);
                }
            }
        }

        // Writers may resume; everything left to do is outside the store's
        // valid namespace. The temp-roots descriptors in `fds` stay open
        // until the end of the collection.
        drop(gc_lock);

        let invalidated = mem::take(&mut state.invalidated);
        for path in &invalidated {
            self.delete_garbage(&mut state, path)?;
        }

        if should_delete(state.action) {
            info!("deleting unused links...");
            self.remove_unused_links(&mut state.results)?;
        }

        if state.action == GcAction::DeleteDead {
            self.catalog.vacuum()?;
        }

        Ok(state.results)
    }

    /// Decide the fate of `path` (and of the derivation/output closure it
    /// belongs to), deleting it when the action says so. Returns `true` iff
    /// the path ended up classified dead.
    fn try_to_delete(&self, state: &mut GcState, path: &Path) -> Result<bool> {
        self.check_interrupt()?;

        // The link farm is cleaned up separately at the end.
        if path == self.settings.links_dir() {
            return Ok(true);
        }

        match fs::symlink_metadata(path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        }

        if state.deleted.contains(path) {
            return Ok(true);
        }
        if state.live.contains(path) {
            return Ok(false);
        }

        debug!(path = %path.display(), "considering whether to delete");

        // With both keep flags set, the liveness graph can contain cycles
        // through derivation/output edges; the strongly connected component
        // is expanded up front and decided as a single unit.
        let mut paths: BTreeSet<PathBuf> = BTreeSet::new();
        if self.catalog.is_valid_path(path)? {
            let mut todo = vec![path.to_path_buf()];
            while let Some(current) = todo.pop() {
                self.settings.assert_store_path(&current)?;
                if !paths.insert(current.clone()) {
                    continue;
                }
                // A derivation stays as long as any of its outputs does.
                if state.keep_derivations && is_derivation(&current) {
                    for output in self.catalog.query_derivation_outputs(&current)? {
                        if self.catalog.is_valid_path(&output)? {
                            todo.push(output);
                        }
                    }
                }
                // An output stays as long as any of its derivers does.
                if state.keep_outputs {
                    todo.extend(self.catalog.query_valid_derivers(&current)?);
                }
            }
        } else {
            // Lock and build-chroot files of builds in flight are not
            // garbage even though they are not valid paths.
            if self.is_active_temp_file(state, path, ".lock")
                || self.is_active_temp_file(state, path, ".chroot")
            {
                return Ok(false);
            }
            paths.insert(path.to_path_buf());
        }

        for current in &paths {
            if state.roots.contains(current) {
                debug!(path = %current.display(), "cannot delete: it is a root");
                return Ok(mark_live(state, &paths));
            }
        }

        // If any referrer of the component survives, so does the component.
        let mut referrers = BTreeSet::new();
        for current in &paths {
            if self.catalog.is_valid_path(current)? {
                referrers.extend(self.catalog.query_referrers(current)?);
            }
        }
        for referrer in &referrers {
            if !paths.contains(referrer) && !self.try_to_delete(state, referrer)? {
                debug!(
                    path = %path.display(),
                    referrer = %referrer.display(),
                    "cannot delete: it has a live referrer"
                );
                return Ok(mark_live(state, &paths));
            }
        }

        // Garbage. Delete referrers-first so that no valid path is ever left
        // with a dangling reference.
        let sorted = topo_sort_paths(self.catalog.as_ref(), &paths)?;
        for current in &sorted {
            if should_delete(state.action) {
                if self.catalog.is_valid_path(current)? {
                    let is_dir = fs::symlink_metadata(current)
                        .map(|metadata| metadata.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        // Only invalidation plus the rename need the global
                        // lock; the renamed tree is removed after release.
                        // The sentinel name sorts outside the valid-path
                        // namespace.
                        info!(path = %current.display(), "invalidating");
                        state.bytes_invalidated +=
                            self.catalog.query_path_info(current)?.nar_size;
                        self.catalog.invalidate_path_checked(current)?;
                        make_writable(current)?;
                        let sentinel = PathBuf::from(format!(
                            "{}-gc-{}",
                            current.display(),
                            std::process::id()
                        ));
                        fs::rename(current, &sentinel).with_context(|| {
                            format!(
                                "unable to rename {} to {}",
                                current.display(),
                                sentinel.display()
                            )
                        })?;
                        state.invalidated.insert(sentinel);
                    } else {
                        self.catalog.invalidate_path_checked(current)?;
                        self.delete_garbage(state, current)?;
                    }
                } else {
                    self.delete_garbage(state, current)?;
                }

                if state.results.bytes_freed + state.bytes_invalidated > state.max_freed {
                    info!(
                        max_freed = state.max_freed,
                        "deleted or invalidated more than the configured budget; stopping"
                    );
                    return Err(LimitReached.into());
                }
            } else {
                debug!(path = %current.display(), "would delete");
            }

            state.deleted.insert(current.clone());
            if state.action != GcAction::ReturnLive {
                state.results.paths.insert(current.clone());
            }
        }

        Ok(true)
    }

    fn delete_garbage(&self, state: &mut GcState, path: &Path) -> Result<()> {
        info!(path = %path.display(), "deleting");
        state.results.bytes_freed += delete_path(path)?;
        Ok(())
    }

    fn is_active_temp_file(&self, state: &GcState, path: &Path, suffix: &str) -> bool {
        let Some(name) = path.to_str() else {
            return false;
        };
        name.strip_suffix(suffix)
            .is_some_and(|stem| state.temp_roots.contains(Path::new(stem)))
    }

    /// Unlink every entry of the link farm whose link count dropped to one:
    /// only the master copy remains, so no store path shares it anymore.
    ///
    /// Racing against the deduplicator is acknowledged; an entry may gain a
    /// link between the stat and the unlink, making this a best-effort
    /// cleanup.
    pub(super) fn remove_unused_links(&self, results: &mut GcResults) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let links_dir = self.settings.links_dir();
        let entries = match fs::read_dir(&links_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", links_dir.display()))
            }
        };

        let mut actual_size = 0u64;
        let mut unshared_size = 0u64;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read entry of {}", links_dir.display()))?;
            self.check_interrupt()?;
            let path = entry.path();
            let metadata = fs::symlink_metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?;
            let size = metadata.blocks() * 512;

            if metadata.nlink() != 1 {
                actual_size += size;
                unshared_size += (metadata.nlink() - 1) * size;
                continue;
            }

            debug!(path = %path.display(), "deleting unused link");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to delete {}", path.display()))
                }
            }
            results.bytes_freed += size;
        }

        let overhead = fs::metadata(&links_dir)
            .map(|metadata| metadata.blocks() * 512)
            .unwrap_or(0);
        let saved_mib =
            (unshared_size as f64 - actual_size as f64 - overhead as f64) / (1024.0 * 1024.0);
        info!(saved_mib, "hard-link deduplication savings");
        Ok(())
    }
}

fn mark_live(state: &mut GcState, paths: &BTreeSet<PathBuf>) -> bool {
    for path in paths {
        state.live.insert(path.clone());
        if state.action == GcAction::ReturnLive {
            state.results.paths.insert(path.clone());
        }
    }
    false
}

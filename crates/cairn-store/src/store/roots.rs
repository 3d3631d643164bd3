//! Root registry and discovery.
//!
//! Permanent roots are symlinks under `<state>/gcroots` that resolve into
//! the store. Indirect roots add one level: a symlink under
//! `<state>/gcroots/auto/<hash>` points at a user-chosen location outside
//! the store, which in turn symlinks into it. Runtime roots come from an
//! external finder program.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace, warn};

use super::{LocalStore, Roots, StoreError};
use crate::fsutil::{canon_path, create_symlink_atomically};
use crate::hash;

impl LocalStore {
    /// Register `path` (a location outside the store that symlinks into it)
    /// as an indirect root.
    pub fn add_indirect_root(&self, path: &Path) -> Result<()> {
        let name = hash::sha1_base32(&path.to_string_lossy());
        let real_root = self.settings.auto_roots_dir().join(name);
        create_symlink_atomically(&real_root, path)
    }

    /// Create a root symlink at `link` pointing to `store_path` and make it
    /// visible to the collector. Returns the canonicalized link path.
    ///
    /// Direct roots must live under the roots directory unless
    /// `allow_outside` is set; indirect roots may live anywhere outside the
    /// store and are additionally registered under `gcroots/auto`.
    pub fn add_perm_root(
        &self,
        store_path: &Path,
        link: &Path,
        indirect: bool,
        allow_outside: bool,
    ) -> Result<PathBuf> {
        let cwd = std::env::current_dir().context("failed to resolve the current directory")?;
        let store_path = canon_path(store_path, &cwd);
        let link = canon_path(link, &cwd);
        self.settings.assert_store_path(&store_path)?;

        if self.settings.is_in_store(&link) {
            return Err(StoreError::RootInsideStore {
                link: link.display().to_string(),
            }
            .into());
        }

        if indirect {
            // Don't clobber a link that points somewhere other than the store.
            if fs::symlink_metadata(&link).is_ok() {
                let points_into_store = fs::read_link(&link)
                    .map(|target| self.settings.is_in_store(&target))
                    .unwrap_or(false);
                if !points_into_store {
                    return Err(StoreError::RootLinkExists {
                        link: link.display().to_string(),
                    }
                    .into());
                }
            }
            create_symlink_atomically(&link, &store_path)?;
            self.add_indirect_root(&link)?;
        } else {
            if !allow_outside {
                let roots_dir = self.settings.gc_roots_dir();
                if !link.starts_with(&roots_dir) || link == roots_dir {
                    return Err(StoreError::RootOutsideRootsDir {
                        link: link.display().to_string(),
                        roots_dir: roots_dir.display().to_string(),
                    }
                    .into());
                }
            }
            create_symlink_atomically(&link, &store_path)?;
        }

        if self.settings.check_root_reachability {
            let roots = self.find_roots()?;
            if !roots.contains_key(&link) {
                warn!(
                    link = %link.display(),
                    store_path = %store_path.display(),
                    "the new root is not in a directory scanned for roots and may be garbage collected"
                );
            }
        }

        // Block while a collection is in progress, so the root cannot be
        // committed concurrently with a scan that would miss it.
        self.sync_with_gc()?;

        Ok(link)
    }

    /// Walk the roots directory and map every link to the valid store path
    /// it resolves to.
    pub fn find_roots(&self) -> Result<Roots> {
        self.find_roots_impl(false)
    }

    pub(super) fn find_roots_impl(&self, delete_stale: bool) -> Result<Roots> {
        let mut roots = Roots::new();
        self.scan_for_roots(&self.settings.gc_roots_dir(), true, delete_stale, &mut roots)?;
        Ok(roots)
    }

    fn scan_for_roots(
        &self,
        path: &Path,
        recurse_symlinks: bool,
        delete_stale: bool,
        roots: &mut Roots,
    ) -> Result<()> {
        self.check_interrupt()?;
        match self.scan_entry(path, recurse_symlinks, delete_stale, roots) {
            Ok(()) => Ok(()),
            // Transient or permission-related failures on one entry must not
            // abort the whole scan.
            Err(err)
                if err.downcast_ref::<std::io::Error>().is_some_and(|io| {
                    matches!(
                        io.kind(),
                        ErrorKind::NotFound
                            | ErrorKind::PermissionDenied
                            | ErrorKind::NotADirectory
                    )
                }) =>
            {
                info!(path = %path.display(), "cannot read potential root");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn scan_entry(
        &self,
        path: &Path,
        recurse_symlinks: bool,
        delete_stale: bool,
        roots: &mut Roots,
    ) -> Result<()> {
        let metadata = fs::symlink_metadata(path)?;
        trace!(path = %path.display(), "looking for roots");

        if metadata.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                self.scan_for_roots(&entry.path(), recurse_symlinks, delete_stale, roots)?;
            }
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            let target = canon_path(&target, path.parent().unwrap_or(Path::new("/")));

            if self.settings.is_in_store(&target) {
                debug!(link = %path.display(), target = %target.display(), "found root");
                let store_path = self.settings.to_store_path(&target)?;
                if self.catalog.is_valid_path(&store_path)? {
                    roots.insert(path.to_path_buf(), store_path);
                } else {
                    info!(
                        link = %path.display(),
                        store_path = %store_path.display(),
                        "skipping invalid root"
                    );
                }
            } else if recurse_symlinks {
                if fs::symlink_metadata(&target).is_ok() {
                    self.scan_for_roots(&target, false, delete_stale, roots)?;
                } else if delete_stale {
                    info!(
                        link = %path.display(),
                        target = %target.display(),
                        "removing stale link"
                    );
                    // Only links inside the gcroots tree are ever removed;
                    // nothing is deleted beyond it.
                    let _ = fs::remove_file(path);
                }
            }
        }

        Ok(())
    }

    /// Run the runtime root finder and union every valid store path it
    /// reports into `roots`. Typically the finder lists paths held open by
    /// running processes.
    pub(super) fn add_additional_roots(&self, roots: &mut BTreeSet<PathBuf>) -> Result<()> {
        let finder = self.settings.root_finder_program();
        if finder.as_os_str().is_empty() {
            return Ok(());
        }
        if !finder.exists() {
            debug!(program = %finder.display(), "runtime root finder not installed");
            return Ok(());
        }

        debug!(program = %finder.display(), "executing the runtime root finder");
        let output = Command::new(&finder)
            .output()
            .with_context(|| format!("failed to run root finder {}", finder.display()))?;
        if !output.status.success() {
            bail!(
                "root finder {} failed with {}",
                finder.display(),
                output.status
            );
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let path = PathBuf::from(line);
            if self.settings.is_in_store(&path) {
                let store_path = self.settings.to_store_path(&path)?;
                if !roots.contains(&store_path) && self.catalog.is_valid_path(&store_path)? {
                    debug!(path = %store_path.display(), "got additional root");
                    roots.insert(store_path);
                }
            }
        }
        Ok(())
    }
}

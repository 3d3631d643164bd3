use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::{Catalog, CatalogError, PathInfo};

/// An in-memory catalog.
///
/// Useful as a test double and for ephemeral stores; registration is explicit
/// via [`MemoryCatalog::register`] and
/// [`MemoryCatalog::register_derivation_output`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    paths: BTreeMap<PathBuf, PathInfo>,
    /// Derivation path to the outputs it is declared to produce.
    outputs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `info.path` as valid with the given metadata, replacing any
    /// previous registration.
    pub fn register(&self, info: PathInfo) {
        let mut inner = self.inner();
        inner.paths.insert(info.path.clone(), info);
    }

    /// Declare `output` as one of the outputs of the derivation `drv`.
    pub fn register_derivation_output(&self, drv: &Path, output: &Path) {
        let mut inner = self.inner();
        inner
            .outputs
            .entry(drv.to_path_buf())
            .or_default()
            .insert(output.to_path_buf());
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for MemoryCatalog {
    fn is_valid_path(&self, path: &Path) -> Result<bool> {
        Ok(self.inner().paths.contains_key(path))
    }

    fn query_referrers(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let inner = self.inner();
        Ok(inner
            .paths
            .iter()
            .filter(|(_, info)| info.references.contains(path))
            .map(|(referrer, _)| referrer.clone())
            .collect())
    }

    fn query_derivation_outputs(&self, drv: &Path) -> Result<BTreeSet<PathBuf>> {
        Ok(self.inner().outputs.get(drv).cloned().unwrap_or_default())
    }

    fn query_valid_derivers(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let inner = self.inner();
        Ok(inner
            .outputs
            .iter()
            .filter(|(drv, outputs)| outputs.contains(path) && inner.paths.contains_key(*drv))
            .map(|(drv, _)| drv.clone())
            .collect())
    }

    fn query_path_info(&self, path: &Path) -> Result<PathInfo> {
        self.inner()
            .paths
            .get(path)
            .cloned()
            .ok_or_else(|| {
                CatalogError::UnknownPath {
                    path: path.display().to_string(),
                }
                .into()
            })
    }

    fn invalidate_path_checked(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner();
        if !inner.paths.contains_key(path) {
            return Err(CatalogError::UnknownPath {
                path: path.display().to_string(),
            }
            .into());
        }
        if let Some((referrer, _)) = inner
            .paths
            .iter()
            .find(|(referrer, info)| referrer.as_path() != path && info.references.contains(path))
        {
            return Err(CatalogError::PathInUse {
                path: path.display().to_string(),
                referrer: referrer.display().to_string(),
            }
            .into());
        }
        inner.paths.remove(path);
        inner.outputs.remove(path);
        Ok(())
    }

    fn vacuum(&self) -> Result<()> {
        Ok(())
    }
}

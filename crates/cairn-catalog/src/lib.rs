//! The validity catalog of a cairn store.
//!
//! The catalog is the authority on which store paths exist, what they
//! reference, and how they relate to the derivations that produced them. The
//! store engine (and in particular the garbage collector) consumes it through
//! the [`Catalog`] trait; two implementations are provided, an in-memory one
//! for tests and embedding, and a SQLite-backed one for persistent stores.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

mod memory;
mod sqlite;

pub use memory::MemoryCatalog;
pub use sqlite::SqliteCatalog;

/// Errors surfaced by catalog implementations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("path {path} is not valid")]
    UnknownPath { path: String },
    #[error("cannot invalidate {path}: it is still referred to by {referrer}")]
    PathInUse { path: String, referrer: String },
    #[error("cycle detected in the reference graph through {path}")]
    ReferenceCycle { path: String },
}

/// Metadata recorded for a valid store path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathInfo {
    pub path: PathBuf,
    /// The derivation that produced this path, if known.
    pub deriver: Option<PathBuf>,
    /// Size of the serialized form of the path contents.
    pub nar_size: u64,
    /// Store paths this path refers to (may include itself).
    pub references: BTreeSet<PathBuf>,
}

/// The catalog contract consumed by the store engine.
///
/// All paths passed in and handed out are store paths, i.e. immediate
/// children of the store directory. Implementations must be safe to share
/// across threads; the garbage collector holds one behind an `Arc`.
pub trait Catalog: Send + Sync {
    /// Whether `path` is registered as valid.
    fn is_valid_path(&self, path: &Path) -> Result<bool>;

    /// All valid paths that refer to `path`.
    fn query_referrers(&self, path: &Path) -> Result<BTreeSet<PathBuf>>;

    /// The output paths registered for the derivation `drv`, valid or not.
    fn query_derivation_outputs(&self, drv: &Path) -> Result<BTreeSet<PathBuf>>;

    /// All valid derivations that list `path` among their outputs.
    fn query_valid_derivers(&self, path: &Path) -> Result<BTreeSet<PathBuf>>;

    /// Full metadata for a valid path. Fails with [`CatalogError::UnknownPath`]
    /// if `path` is not valid.
    fn query_path_info(&self, path: &Path) -> Result<PathInfo>;

    /// Remove `path` from the set of valid paths.
    ///
    /// Fails with [`CatalogError::PathInUse`] while any other valid path
    /// still refers to `path`; self-references do not count.
    fn invalidate_path_checked(&self, path: &Path) -> Result<()>;

    /// Compact the underlying storage. A no-op for implementations that have
    /// nothing to compact.
    fn vacuum(&self) -> Result<()>;
}

/// Whether `path` names a derivation (a build recipe) rather than a built
/// artifact. Decided purely by name so it also works for invalid paths.
pub fn is_derivation(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "drv")
}

/// Sort `paths` such that every path appears before the paths it refers to,
/// considering only reference edges within the set. Self-references are
/// skipped; a genuine cycle is an error.
///
/// Deleting paths in the returned order never leaves a valid path with a
/// dangling reference.
pub fn topo_sort_paths(catalog: &dyn Catalog, paths: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut sorted = Vec::with_capacity(paths.len());
    let mut visited = BTreeSet::new();
    let mut parents = BTreeSet::new();
    for path in paths {
        dfs_visit(catalog, paths, path, &mut visited, &mut parents, &mut sorted)?;
    }
    sorted.reverse();
    Ok(sorted)
}

fn dfs_visit(
    catalog: &dyn Catalog,
    paths: &BTreeSet<PathBuf>,
    path: &Path,
    visited: &mut BTreeSet<PathBuf>,
    parents: &mut BTreeSet<PathBuf>,
    sorted: &mut Vec<PathBuf>,
) -> Result<()> {
    if parents.contains(path) {
        return Err(CatalogError::ReferenceCycle {
            path: path.display().to_string(),
        }
        .into());
    }
    if !visited.insert(path.to_path_buf()) {
        return Ok(());
    }
    parents.insert(path.to_path_buf());
    if catalog.is_valid_path(path)? {
        for reference in catalog.query_path_info(path)?.references {
            if reference.as_path() != path && paths.contains(&reference) {
                dfs_visit(catalog, paths, &reference, visited, parents, sorted)?;
            }
        }
    }
    parents.remove(path);
    sorted.push(path.to_path_buf());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_are_recognized_by_name() {
        assert!(is_derivation(Path::new("/store/abc-hello.drv")));
        assert!(!is_derivation(Path::new("/store/abc-hello")));
        assert!(!is_derivation(Path::new("/store/abc-hello.drv.lock")));
    }

    #[test]
    fn topo_sort_puts_referrers_first() -> Result<()> {
        let catalog = MemoryCatalog::new();
        let a = PathBuf::from("/store/a");
        let b = PathBuf::from("/store/b");
        let c = PathBuf::from("/store/c");
        // a refers to b, b refers to c.
        catalog.register(PathInfo {
            path: a.clone(),
            references: [b.clone()].into(),
            ..PathInfo::default()
        });
        catalog.register(PathInfo {
            path: b.clone(),
            references: [c.clone()].into(),
            ..PathInfo::default()
        });
        catalog.register(PathInfo {
            path: c.clone(),
            ..PathInfo::default()
        });

        let set: BTreeSet<PathBuf> = [a.clone(), b.clone(), c.clone()].into();
        let sorted = topo_sort_paths(&catalog, &set)?;
        assert_eq!(sorted, vec![a, b, c]);
        Ok(())
    }

    #[test]
    fn topo_sort_skips_self_references_and_invalid_paths() -> Result<()> {
        let catalog = MemoryCatalog::new();
        let a = PathBuf::from("/store/a");
        catalog.register(PathInfo {
            path: a.clone(),
            references: [a.clone()].into(),
            ..PathInfo::default()
        });
        let ghost = PathBuf::from("/store/ghost");

        let set: BTreeSet<PathBuf> = [a.clone(), ghost.clone()].into();
        let sorted = topo_sort_paths(&catalog, &set)?;
        assert_eq!(sorted.len(), 2);
        assert!(sorted.contains(&a));
        assert!(sorted.contains(&ghost));
        Ok(())
    }

    #[test]
    fn topo_sort_rejects_cycles() {
        let catalog = MemoryCatalog::new();
        let a = PathBuf::from("/store/a");
        let b = PathBuf::from("/store/b");
        catalog.register(PathInfo {
            path: a.clone(),
            references: [b.clone()].into(),
            ..PathInfo::default()
        });
        catalog.register(PathInfo {
            path: b.clone(),
            references: [a.clone()].into(),
            ..PathInfo::default()
        });

        let set: BTreeSet<PathBuf> = [a, b].into();
        let err = topo_sort_paths(&catalog, &set).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::ReferenceCycle { .. })
        ));
    }
}

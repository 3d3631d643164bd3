#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::Result;
use cairn_catalog::{Catalog, MemoryCatalog, PathInfo};
use cairn_store::{LocalStore, Settings};
use tempfile::TempDir;

/// A throwaway store rooted in a temporary directory, backed by an
/// in-memory catalog.
pub struct StoreHarness {
    pub temp: TempDir,
    pub store: Arc<LocalStore>,
    pub catalog: Arc<MemoryCatalog>,
}

pub fn harness() -> Result<StoreHarness> {
    init_test_logging();
    let temp = tempfile::tempdir()?;
    let store_dir = temp.path().join("store");
    let state_dir = temp.path().join("var");
    fs::create_dir_all(&store_dir)?;
    fs::create_dir_all(&state_dir)?;
    let catalog = Arc::new(MemoryCatalog::new());
    let store = Arc::new(LocalStore::new(
        Settings::new(store_dir, state_dir),
        catalog.clone() as Arc<dyn Catalog>,
    ));
    Ok(StoreHarness {
        temp,
        store,
        catalog,
    })
}

/// Same as [`harness`], but with both keep flags enabled so that
/// derivation/output edges participate in liveness.
pub fn harness_with_keep_flags() -> Result<StoreHarness> {
    init_test_logging();
    let temp = tempfile::tempdir()?;
    let store_dir = temp.path().join("store");
    let state_dir = temp.path().join("var");
    fs::create_dir_all(&store_dir)?;
    fs::create_dir_all(&state_dir)?;
    let catalog = Arc::new(MemoryCatalog::new());
    let mut settings = Settings::new(store_dir, state_dir);
    settings.keep_outputs = true;
    settings.keep_derivations = true;
    let store = Arc::new(LocalStore::new(
        settings,
        catalog.clone() as Arc<dyn Catalog>,
    ));
    Ok(StoreHarness {
        temp,
        store,
        catalog,
    })
}

impl StoreHarness {
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.store.settings().store_dir.join(name)
    }

    /// Create a directory store path on disk and register it as valid with
    /// the given references.
    pub fn add_path(&self, name: &str, references: &[&str]) -> Result<PathBuf> {
        let path = self.store_path(name);
        fs::create_dir_all(&path)?;
        fs::write(path.join("data"), name)?;
        self.catalog.register(PathInfo {
            path: path.clone(),
            deriver: None,
            nar_size: 1024,
            references: references.iter().map(|name| self.store_path(name)).collect(),
        });
        Ok(path)
    }

    /// Create a derivation store path (`<name>.drv`) producing `outputs`.
    pub fn add_derivation(&self, name: &str, outputs: &[&str]) -> Result<PathBuf> {
        assert!(name.ends_with(".drv"), "derivation names end in .drv");
        let drv = self.add_path(name, &[])?;
        for output in outputs {
            self.catalog
                .register_derivation_output(&drv, &self.store_path(output));
        }
        Ok(drv)
    }

    pub fn root_link(&self, name: &str) -> PathBuf {
        self.store.settings().gc_roots_dir().join(name)
    }

    pub fn is_valid(&self, path: &Path) -> bool {
        self.catalog
            .is_valid_path(path)
            .expect("memory catalog is infallible")
    }

    pub fn valid_paths(&self) -> BTreeSet<PathBuf> {
        fs::read_dir(&self.store.settings().store_dir)
            .into_iter()
            .flatten()
            .map(|entry| entry.expect("dir entry").path())
            .filter(|path| self.is_valid(path))
            .collect()
    }
}

fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

//! Store configuration.
//!
//! Settings are plain data; [`Settings::from_env`] builds them from the
//! process environment, tests construct them directly against temporary
//! directories.

use std::env;
use std::path::{Path, PathBuf};

use crate::store::StoreError;

/// Configuration of a local store instance.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Directory whose immediate children are the store paths.
    pub store_dir: PathBuf,
    /// State directory holding the GC lock, roots and temp-roots files.
    pub state_dir: PathBuf,
    /// Installation directory for helper programs.
    pub libexec_dir: PathBuf,
    /// Keep outputs of live derivations alive.
    pub keep_outputs: bool,
    /// Keep derivations of live outputs alive.
    pub keep_derivations: bool,
    /// After registering a root, warn when it cannot be found again.
    pub check_root_reachability: bool,
    /// Explicit override for the runtime root finder program.
    pub root_finder: Option<PathBuf>,
}

impl Settings {
    /// Settings for the given store and state directories with default flags.
    pub fn new(store_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            store_dir: store_dir.into(),
            libexec_dir: state_dir.join("libexec"),
            state_dir,
            keep_outputs: false,
            keep_derivations: true,
            check_root_reachability: false,
            root_finder: None,
        }
    }

    /// Build settings from `CAIRN_*` environment variables, falling back to
    /// the installation defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::new(
            env_path("CAIRN_STORE_DIR", "/cairn/store"),
            env_path("CAIRN_STATE_DIR", "/cairn/var/cairn"),
        );
        settings.libexec_dir = env_path("CAIRN_LIBEXEC_DIR", "/cairn/libexec");
        settings.keep_outputs = env_flag("CAIRN_KEEP_OUTPUTS", false);
        settings.keep_derivations = env_flag("CAIRN_KEEP_DERIVATIONS", true);
        settings.check_root_reachability = env_flag("CAIRN_CHECK_ROOT_REACHABILITY", false);
        settings.root_finder = env::var_os("CAIRN_ROOT_FINDER").map(PathBuf::from);
        settings
    }

    pub fn gc_lock_file(&self) -> PathBuf {
        self.state_dir.join("gc.lock")
    }

    pub fn gc_roots_dir(&self) -> PathBuf {
        self.state_dir.join("gcroots")
    }

    pub fn auto_roots_dir(&self) -> PathBuf {
        self.gc_roots_dir().join("auto")
    }

    pub fn temp_roots_dir(&self) -> PathBuf {
        self.state_dir.join("temproots")
    }

    /// The flat directory of hard-link masters used for deduplication.
    pub fn links_dir(&self) -> PathBuf {
        self.store_dir.join(".links")
    }

    /// The program that reports runtime roots, one path per line. An empty
    /// override disables runtime root discovery.
    pub fn root_finder_program(&self) -> PathBuf {
        self.root_finder
            .clone()
            .unwrap_or_else(|| self.libexec_dir.join("find-runtime-roots"))
    }

    /// Whether `path` lies below the store directory.
    pub fn is_in_store(&self, path: &Path) -> bool {
        path.starts_with(&self.store_dir) && path != self.store_dir
    }

    /// Truncate a path below the store directory to the store path
    /// containing it.
    pub fn to_store_path(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let not_in_store = || StoreError::NotInStore {
            path: path.display().to_string(),
        };
        let relative = path
            .strip_prefix(&self.store_dir)
            .map_err(|_| not_in_store())?;
        let first = relative.components().next().ok_or_else(not_in_store)?;
        Ok(self.store_dir.join(first.as_os_str()))
    }

    /// Require `path` to be an immediate child of the store directory.
    pub fn assert_store_path(&self, path: &Path) -> Result<(), StoreError> {
        if path.parent() == Some(self.store_dir.as_path()) && path.file_name().is_some() {
            Ok(())
        } else {
            Err(StoreError::NotAStorePath {
                path: path.display().to_string(),
            })
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => {
            let lowered = value.to_ascii_lowercase();
            if default {
                lowered != "0" && lowered != "false"
            } else {
                lowered == "1" || lowered == "true"
            }
        }
        Err(_) => default,
    }
}

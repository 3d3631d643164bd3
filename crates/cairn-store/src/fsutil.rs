//! Filesystem helpers shared by the root registry and the collector.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::trace;

/// Lexically absolutize `path` against `base`, folding `.` and `..` without
/// touching the filesystem. Symlink targets are resolved this way against the
/// directory containing the link, so the result is well defined even when the
/// target does not exist.
pub fn canon_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Create a symlink at `link` pointing to `target`, atomically replacing
/// whatever was there. The parent directory is created if missing. A failed
/// replacement leaves the previous `link` intact.
pub fn create_symlink_atomically(link: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let tmp = PathBuf::from(format!(
        "{}.tmp-{}-{}",
        link.display(),
        std::process::id(),
        rand::random::<u32>()
    ));
    std::os::unix::fs::symlink(target, &tmp)
        .with_context(|| format!("failed to symlink {} to {}", tmp.display(), target.display()))?;
    if let Err(err) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(err)
            .with_context(|| format!("cannot rename {} to {}", tmp.display(), link.display()));
    }
    Ok(())
}

/// Give the owner write permission on `path`. Some filesystems refuse to
/// rename read-only directories, and store paths are registered read-only.
pub fn make_writable(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o200 == 0 {
        permissions.set_mode(mode | 0o200);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("failed to make {} writable", path.display()))?;
    }
    Ok(())
}

/// Recursively delete `path`, returning an estimate of the disk bytes freed
/// (block-based, matching `du`). A missing path counts as already deleted.
pub fn delete_path(path: &Path) -> Result<u64> {
    let mut bytes_freed = 0u64;
    delete_path_impl(path, &mut bytes_freed)?;
    Ok(bytes_freed)
}

fn delete_path_impl(path: &Path, bytes_freed: &mut u64) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()))
        }
    };
    trace!(path = %path.display(), "removing");
    *bytes_freed += metadata.blocks() * 512;
    if metadata.is_dir() {
        // Entries of read-only directories cannot be unlinked.
        let mode = metadata.permissions().mode();
        if mode & 0o700 != 0o700 {
            let mut permissions = metadata.permissions();
            permissions.set_mode(mode | 0o700);
            fs::set_permissions(path, permissions)
                .with_context(|| format!("failed to make {} writable", path.display()))?;
        }
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry of {}", path.display()))?;
            delete_path_impl(&entry.path(), bytes_freed)?;
        }
        match fs::remove_dir(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    } else {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to unlink {}", path.display()))
            }
        }
    }
    Ok(())
}

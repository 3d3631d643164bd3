use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{Catalog, CatalogError, PathInfo};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS valid_paths (
    path          TEXT PRIMARY KEY,
    deriver       TEXT,
    nar_size      INTEGER NOT NULL DEFAULT 0,
    registered_at INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS refs (
    referrer  TEXT NOT NULL,
    reference TEXT NOT NULL,
    PRIMARY KEY (referrer, reference)
);
CREATE INDEX IF NOT EXISTS idx_refs_reference ON refs(reference);
CREATE TABLE IF NOT EXISTS derivation_outputs (
    drv    TEXT NOT NULL,
    output TEXT NOT NULL,
    PRIMARY KEY (drv, output)
);
CREATE INDEX IF NOT EXISTS idx_derivation_outputs_output ON derivation_outputs(output);
";

/// A catalog persisted in a SQLite database.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (creating if necessary) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open catalog database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory catalog, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize the catalog schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record `info.path` as valid with the given metadata, replacing any
    /// previous registration.
    pub fn register(&self, info: &PathInfo) -> Result<()> {
        let key = path_text(&info.path);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO valid_paths (path, deriver, nar_size, registered_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                info.deriver.as_deref().map(path_text),
                info.nar_size as i64,
                timestamp_secs() as i64,
            ],
        )?;
        tx.execute("DELETE FROM refs WHERE referrer = ?1", params![key])?;
        for reference in &info.references {
            tx.execute(
                "INSERT OR IGNORE INTO refs (referrer, reference) VALUES (?1, ?2)",
                params![key, path_text(reference)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Declare `output` as one of the outputs of the derivation `drv`.
    pub fn register_derivation_output(&self, drv: &Path, output: &Path) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO derivation_outputs (drv, output) VALUES (?1, ?2)",
            params![path_text(drv), path_text(output)],
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for SqliteCatalog {
    fn is_valid_path(&self, path: &Path) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM valid_paths WHERE path = ?1",
                params![path_text(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn query_referrers(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.referrer FROM refs r \
             JOIN valid_paths v ON v.path = r.referrer \
             WHERE r.reference = ?1",
        )?;
        let rows = stmt
            .query_map(params![path_text(path)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(PathBuf::from).collect())
    }

    fn query_derivation_outputs(&self, drv: &Path) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT output FROM derivation_outputs WHERE drv = ?1")?;
        let rows = stmt
            .query_map(params![path_text(drv)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(PathBuf::from).collect())
    }

    fn query_valid_derivers(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT d.drv FROM derivation_outputs d \
             JOIN valid_paths v ON v.path = d.drv \
             WHERE d.output = ?1",
        )?;
        let rows = stmt
            .query_map(params![path_text(path)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(PathBuf::from).collect())
    }

    fn query_path_info(&self, path: &Path) -> Result<PathInfo> {
        let key = path_text(path);
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT deriver, nar_size FROM valid_paths WHERE path = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .optional()?;
        let Some((deriver, nar_size)) = row else {
            return Err(CatalogError::UnknownPath {
                path: path.display().to_string(),
            }
            .into());
        };
        let mut stmt = conn.prepare("SELECT reference FROM refs WHERE referrer = ?1")?;
        let references = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(PathInfo {
            path: path.to_path_buf(),
            deriver: deriver.map(PathBuf::from),
            nar_size,
            references: references.into_iter().map(PathBuf::from).collect(),
        })
    }

    fn invalidate_path_checked(&self, path: &Path) -> Result<()> {
        let key = path_text(path);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let valid: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM valid_paths WHERE path = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if valid.is_none() {
            return Err(CatalogError::UnknownPath {
                path: path.display().to_string(),
            }
            .into());
        }
        let referrer: Option<String> = tx
            .query_row(
                "SELECT r.referrer FROM refs r \
                 JOIN valid_paths v ON v.path = r.referrer \
                 WHERE r.reference = ?1 AND r.referrer <> ?1 \
                 LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(referrer) = referrer {
            return Err(CatalogError::PathInUse {
                path: path.display().to_string(),
                referrer,
            }
            .into());
        }
        tx.execute("DELETE FROM refs WHERE referrer = ?1", params![key])?;
        tx.execute(
            "DELETE FROM derivation_outputs WHERE drv = ?1",
            params![key],
        )?;
        tx.execute("DELETE FROM valid_paths WHERE path = ?1", params![key])?;
        tx.commit()?;
        Ok(())
    }

    fn vacuum(&self) -> Result<()> {
        debug!("vacuuming the catalog database");
        self.conn()
            .execute_batch("VACUUM;")
            .context("failed to vacuum the catalog database")?;
        Ok(())
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, references: &[&str]) -> PathInfo {
        PathInfo {
            path: PathBuf::from(path),
            references: references.iter().map(PathBuf::from).collect(),
            nar_size: 2048,
            deriver: Some(PathBuf::from("/store/pkg.drv")),
        }
    }

    #[test]
    fn survives_reopening() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("catalog.sqlite");
        {
            let catalog = SqliteCatalog::open(&db)?;
            catalog.register(&info("/store/a", &["/store/b"]))?;
        }
        let catalog = SqliteCatalog::open(&db)?;
        assert!(catalog.is_valid_path(Path::new("/store/a"))?);
        let fetched = catalog.query_path_info(Path::new("/store/a"))?;
        assert_eq!(fetched.nar_size, 2048);
        assert_eq!(fetched.deriver, Some(PathBuf::from("/store/pkg.drv")));
        Ok(())
    }

    #[test]
    fn referrers_and_invalidation() -> Result<()> {
        let catalog = SqliteCatalog::open_in_memory()?;
        catalog.register(&info("/store/a", &["/store/b"]))?;
        catalog.register(&info("/store/b", &[]))?;

        assert_eq!(
            catalog.query_referrers(Path::new("/store/b"))?,
            [PathBuf::from("/store/a")].into()
        );

        let err = catalog
            .invalidate_path_checked(Path::new("/store/b"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::PathInUse { .. })
        ));

        catalog.invalidate_path_checked(Path::new("/store/a"))?;
        catalog.invalidate_path_checked(Path::new("/store/b"))?;
        assert!(!catalog.is_valid_path(Path::new("/store/b"))?);
        Ok(())
    }

    #[test]
    fn derivation_relations() -> Result<()> {
        let catalog = SqliteCatalog::open_in_memory()?;
        let drv = Path::new("/store/pkg.drv");
        let out = Path::new("/store/pkg");
        catalog.register(&info("/store/pkg.drv", &[]))?;
        catalog.register(&info("/store/pkg", &[]))?;
        catalog.register_derivation_output(drv, out)?;

        assert_eq!(
            catalog.query_derivation_outputs(drv)?,
            [out.to_path_buf()].into()
        );
        assert_eq!(
            catalog.query_valid_derivers(out)?,
            [drv.to_path_buf()].into()
        );

        catalog.invalidate_path_checked(drv)?;
        assert!(catalog.query_valid_derivers(out)?.is_empty());
        Ok(())
    }

    #[test]
    fn vacuum_runs() -> Result<()> {
        let catalog = SqliteCatalog::open_in_memory()?;
        catalog.register(&info("/store/a", &[]))?;
        catalog.vacuum()?;
        Ok(())
    }
}

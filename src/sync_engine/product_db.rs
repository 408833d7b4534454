//! SQLite product database shared by the work queue and the failure ledger.
//!
//! Owns the connection, the `products` schema, integrity checking and the
//! backup-and-reset recovery path. Both files have the same shape, so this is
//! implemented once here.

use super::errors::SyncError;
use super::models::{Progress, WorkItem};
use super::schema::PRODUCTS_TABLE;
use crate::sqlite_persistence::check_file_integrity;
use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const WORK_ITEM_COLUMNS: &str = "name, id, attempts, progress, created, modified";

lazy_static! {
    static ref BACKUP_INDEX: Regex = Regex::new(r"_backup_(\d+)").unwrap();
}

pub struct ProductDb {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl ProductDb {
    /// Open (or create) the database file and make sure the schema exists.
    /// Does not check integrity.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {:?}", parent)
                })?;
            }
        }
        let conn = Self::connect(&path)?;
        let db = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Open the database file, check it, and replace it with a fresh empty
    /// one if it is unreadable or its schema does not match.
    ///
    /// Only a failure to recreate the empty database is reported as an error.
    pub fn open_or_recover<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {:?}", parent))
                    .map_err(|e| SyncError::Storage(format!("{:#}", e)))?;
            }
        }

        let conn = Self::connect(&path)
            .map_err(|e| SyncError::Storage(format!("{:#}", e)))?;
        let db = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };

        let healthy = match db.ensure_schema() {
            Ok(()) => db.check_integrity(),
            Err(e) => {
                warn!("Could not prepare schema in {:?}: {:#}", db.path, e);
                false
            }
        };

        if !healthy {
            let backup = db.backup_and_reset().map_err(|e| {
                SyncError::Storage(format!(
                    "could not reset corrupt database {:?}: {:#}",
                    db.path, e
                ))
            })?;
            warn!(
                "Database {:?} failed its integrity check, moved to {:?} and recreated empty",
                db.path, backup
            );
        }

        Ok(db)
    }

    /// In-memory database, used by tests that do not touch the ledger.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Connection lock for {:?} is poisoned", self.path))
    }

    /// Idempotent creation of the `products` table.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        PRODUCTS_TABLE.create(&conn)
    }

    /// Returns true when SQLite reports the file as consistent and the
    /// `products` table has exactly the expected shape.
    pub fn check_integrity(&self) -> bool {
        let conn = match self.lock() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("{:#}", e);
                return false;
            }
        };
        if let Err(e) = check_file_integrity(&conn) {
            warn!("Integrity check of {:?} failed: {:#}", self.path, e);
            return false;
        }
        if let Err(e) = PRODUCTS_TABLE.validate(&conn) {
            warn!("Schema check of {:?} failed: {:#}", self.path, e);
            return false;
        }
        true
    }

    /// Move the current file aside as `<base>_backup_<NNN><ext>` and start
    /// over with an empty schema at the original path.
    pub fn backup_and_reset(&self) -> Result<PathBuf> {
        let mut conn = self.lock()?;
        let backup_path = next_backup_path(&self.path)?;

        // Close the live handle before touching the file.
        let old = std::mem::replace(&mut *conn, Connection::open_in_memory()?);
        if let Err((_, e)) = old.close() {
            warn!("Closing {:?} before backup reported: {}", self.path, e);
        }

        if self.path.exists() {
            std::fs::rename(&self.path, &backup_path).with_context(|| {
                format!("Failed to move {:?} to {:?}", self.path, backup_path)
            })?;
        }
        move_side_files(&self.path, &backup_path)?;

        let fresh = Self::connect(&self.path)?;
        PRODUCTS_TABLE.create(&fresh)?;
        *conn = fresh;

        info!("Backed up {:?} to {:?}", self.path, backup_path);
        Ok(backup_path)
    }

    pub fn get(&self, name: &str) -> Result<Option<WorkItem>> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                &format!("SELECT {} FROM products WHERE name = ?1", WORK_ITEM_COLUMNS),
                [name],
                row_to_work_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Rows in insertion order.
    pub fn list(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM products ORDER BY ROWID LIMIT ?1",
            WORK_ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map([limit as i64], row_to_work_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn count_with_progress(&self, progress: Progress) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM products WHERE progress = ?1",
            [progress.as_db_str()],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

pub(crate) fn row_to_work_item(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        name: row.get("name")?,
        id: row.get::<_, Option<String>>("id")?.unwrap_or_default(),
        attempts: row.get::<_, Option<u32>>("attempts")?.unwrap_or(0),
        progress: row
            .get::<_, Option<String>>("progress")?
            .and_then(|s| Progress::from_db_str(&s)),
        created: row.get::<_, Option<String>>("created")?.unwrap_or_default(),
        modified: row.get::<_, Option<String>>("modified")?.unwrap_or_default(),
    })
}

/// `<dir>/<stem>_backup_<NNN><ext>` with NNN one above the highest existing
/// backup of the same file.
fn next_backup_path(path: &Path) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Database path {:?} has no file name", path))?;
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let prefix = format!("{}_backup_", stem);
    let mut highest = 0u32;
    if dir.exists() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {:?}", dir))?
        {
            let file_name = entry?.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with(&prefix) || !file_name.ends_with(&ext) {
                continue;
            }
            let tail = &file_name[stem.len()..file_name.len() - ext.len()];
            if let Some(caps) = BACKUP_INDEX.captures(tail) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(tail.len()) {
                    if let Ok(index) = caps[1].parse::<u32>() {
                        highest = highest.max(index);
                    }
                }
            }
        }
    }

    Ok(dir.join(format!("{}_backup_{:03}{}", stem, highest + 1, ext)))
}

fn side_file(db_path: &Path, suffix: &str) -> PathBuf {
    let mut side = db_path.as_os_str().to_owned();
    side.push(suffix);
    PathBuf::from(side)
}

/// The WAL and rollback journal may hold committed pages of the old file, so
/// they follow it to `<backup>-wal` / `<backup>-journal`. The shared-memory
/// index is only a cache and is dropped.
fn move_side_files(db_path: &Path, backup_path: &Path) -> Result<()> {
    for suffix in ["-wal", "-journal"] {
        let side = side_file(db_path, suffix);
        if side.exists() {
            let target = side_file(backup_path, suffix);
            std::fs::rename(&side, &target)
                .with_context(|| format!("Failed to move {:?} to {:?}", side, target))?;
        }
    }
    let shm = side_file(db_path, "-shm");
    if shm.exists() {
        std::fs::remove_file(&shm).with_context(|| format!("Failed to remove {:?}", shm))?;
    }
    Ok(())
}

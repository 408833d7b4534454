//! Durable work queue.
//!
//! Rows move `Pending` → `In Progress` (lease) → deleted (complete) or back to
//! `Pending` with one more attempt (retry). Rows that ran out of attempts are
//! moved to the failure ledger.

use super::failure_ledger::FailureLedger;
use super::models::*;
use super::product_db::ProductDb;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Trait for work queue storage operations.
pub trait WorkQueueStore: Send + Sync {
    // === Schema ===

    /// Create the `products` table if it does not exist.
    fn ensure_schema(&self) -> Result<()>;

    /// True when the file is consistent and the table has the expected shape.
    fn check_integrity(&self) -> bool;

    /// Move the file aside and recreate an empty queue. Returns the backup path.
    fn backup_and_reset(&self) -> Result<std::path::PathBuf>;

    // === Queue Management ===

    /// Insert new products as `Pending`. Names already present are ignored.
    /// Returns how many rows were actually added.
    fn enqueue(&self, items: &[NewProduct]) -> Result<usize>;

    fn count_pending(&self) -> Result<usize>;

    fn counts(&self) -> Result<QueueCounts>;

    fn get(&self, name: &str) -> Result<Option<WorkItem>>;

    fn list(&self, limit: usize) -> Result<Vec<WorkItem>>;

    // === State Transitions (atomic) ===

    /// Claim up to `limit` of the oldest pending rows.
    fn lease(&self, limit: usize) -> Result<Vec<LeasedProduct>>;

    /// Delete finished rows.
    fn complete(&self, items: &[LeasedProduct]) -> Result<()>;

    /// Hand failed rows back to the queue with one more attempt recorded.
    fn retry(&self, items: &[LeasedProduct]) -> Result<()>;

    /// Move every row with `attempts >= limit` to the ledger.
    fn quarantine(&self, ledger: &FailureLedger, limit: u32) -> Result<usize>;

    /// Deal with leases abandoned by a crashed or interrupted run.
    fn recover_stale(
        &self,
        ledger: &FailureLedger,
        staleness: Duration,
        limit: u32,
    ) -> Result<RecoveryReport>;
}

pub struct SqliteWorkQueueStore {
    db: ProductDb,
}

impl SqliteWorkQueueStore {
    /// Open the queue file, creating it if needed. Fails on a corrupt file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: ProductDb::open(path)?,
        })
    }

    /// Open the queue file, replacing it with an empty one if it is corrupt.
    pub fn open_or_recover<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = ProductDb::open_or_recover(path)?;
        info!("Work queue ready at {:?}", db.path());
        Ok(Self { db })
    }

    /// In-memory queue for tests. Quarantine needs an on-disk queue.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: ProductDb::in_memory()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    fn staleness_modifier(staleness: Duration) -> String {
        format!("-{} seconds", staleness.as_secs())
    }
}

/// Attach the ledger, move the rows selected by `condition` into it and
/// delete them from the queue, all in one transaction.
fn move_to_ledger(
    conn: &mut Connection,
    ledger: &FailureLedger,
    condition: &str,
    condition_params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<String>> {
    let ledger_path = ledger.path().to_string_lossy().into_owned();
    conn.execute("ATTACH DATABASE ?1 AS ledger", [&ledger_path])
        .with_context(|| format!("Failed to attach failure ledger {}", ledger_path))?;

    let moved = (|| -> Result<Vec<String>> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let names = {
            let mut stmt = tx.prepare(&format!(
                "SELECT name FROM main.products WHERE {} ORDER BY ROWID",
                condition
            ))?;
            let names = stmt
                .query_map(condition_params, |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };
        if names.is_empty() {
            return Ok(names);
        }
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO ledger.products (name, id, attempts, progress, created, modified)
                 SELECT name, id, attempts, 'Failed', created, datetime('now')
                 FROM main.products WHERE {}",
                condition
            ),
            condition_params,
        )?;
        tx.execute(
            &format!("DELETE FROM main.products WHERE {}", condition),
            condition_params,
        )?;
        tx.commit()?;
        Ok(names)
    })();

    conn.execute("DETACH DATABASE ledger", [])
        .context("Failed to detach failure ledger")?;
    moved
}

impl WorkQueueStore for SqliteWorkQueueStore {
    fn ensure_schema(&self) -> Result<()> {
        self.db.ensure_schema()
    }

    fn check_integrity(&self) -> bool {
        self.db.check_integrity()
    }

    fn backup_and_reset(&self) -> Result<std::path::PathBuf> {
        self.db.backup_and_reset()
    }

    fn enqueue(&self, items: &[NewProduct]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO products (name, id) VALUES (?1, ?2)")?;
            for item in items {
                added += stmt.execute(params![item.name, item.id])?;
            }
        }
        tx.commit()?;
        debug!("Enqueued {} of {} products", added, items.len());
        Ok(added)
    }

    fn count_pending(&self) -> Result<usize> {
        self.db.count_with_progress(Progress::Pending)
    }

    fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            pending: self.db.count_with_progress(Progress::Pending)?,
            in_progress: self.db.count_with_progress(Progress::InProgress)?,
        })
    }

    fn get(&self, name: &str) -> Result<Option<WorkItem>> {
        self.db.get(name)
    }

    fn list(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.db.list(limit)
    }

    fn lease(&self, limit: usize) -> Result<Vec<LeasedProduct>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.db.lock()?;
        // IMMEDIATE takes the write lock up front so two leases, even from
        // different connections, cannot select the same rows.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let leased = {
            let mut stmt = tx.prepare(
                "SELECT id, name FROM products
                 WHERE progress = 'Pending'
                 ORDER BY ROWID
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok(LeasedProduct {
                        id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        name: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        {
            let mut update = tx.prepare(
                "UPDATE products SET progress = 'In Progress', modified = datetime('now')
                 WHERE name = ?1",
            )?;
            for item in &leased {
                update.execute([&item.name])?;
            }
        }
        tx.commit()?;
        debug!("Leased {} products", leased.len());
        Ok(leased)
    }

    fn complete(&self, items: &[LeasedProduct]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM products WHERE id = ?1")?;
            for item in items {
                stmt.execute([&item.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn retry(&self, items: &[LeasedProduct]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE products
                 SET attempts = attempts + 1, progress = 'Pending', modified = datetime('now')
                 WHERE id = ?1",
            )?;
            for item in items {
                stmt.execute([&item.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn quarantine(&self, ledger: &FailureLedger, limit: u32) -> Result<usize> {
        let mut conn = self.db.lock()?;
        let moved = move_to_ledger(&mut conn, ledger, "attempts >= ?1", params![limit])?;
        for name in &moved {
            warn!(
                "Product {} failed {} or more times, moved to the failure ledger",
                name, limit
            );
        }
        Ok(moved.len())
    }

    fn recover_stale(
        &self,
        ledger: &FailureLedger,
        staleness: Duration,
        limit: u32,
    ) -> Result<RecoveryReport> {
        let modifier = Self::staleness_modifier(staleness);
        let mut conn = self.db.lock()?;

        let quarantined = move_to_ledger(
            &mut conn,
            ledger,
            "progress = 'In Progress' AND modified < datetime('now', ?1) AND attempts >= ?2",
            params![modifier, limit],
        )?;
        for name in &quarantined {
            warn!(
                "Stale product {} had no attempts left, moved to the failure ledger",
                name
            );
        }

        let reset_to_pending = conn.execute(
            "UPDATE products SET progress = 'Pending', modified = datetime('now')
             WHERE progress = 'In Progress' AND modified < datetime('now', ?1)",
            [&modifier],
        )?;
        if reset_to_pending > 0 {
            info!(
                "Reset {} stale in-progress products back to pending",
                reset_to_pending
            );
        }

        Ok(RecoveryReport {
            reset_to_pending,
            quarantined: quarantined.len(),
        })
    }
}

//! Failure ledger: the separate database holding products that ran out of
//! download attempts. Rows only arrive here through the work queue's
//! quarantine and stale-lease recovery.

use super::models::WorkItem;
use super::product_db::ProductDb;
use anyhow::Result;
use std::path::Path;
use tracing::info;

pub struct FailureLedger {
    db: ProductDb,
}

impl FailureLedger {
    pub fn open_or_recover<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = ProductDb::open_or_recover(path)?;
        info!("Failure ledger ready at {:?}", db.path());
        Ok(Self { db })
    }

    /// Open without the integrity check, so a damaged file is reported
    /// instead of being replaced.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: ProductDb::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn len(&self) -> Result<usize> {
        self.db.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.db.get(name)?.is_some())
    }

    pub fn get(&self, name: &str) -> Result<Option<WorkItem>> {
        self.db.get(name)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.db.list(limit)
    }

    pub fn check_integrity(&self) -> bool {
        self.db.check_integrity()
    }
}

//! Data models for the sync engine.
//!
//! Work items, leased products, batch and recovery reports.

use serde::Serialize;

/// Progress of a row in a product database.
///
/// `Failed` only ever appears in the failure ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Progress {
    Pending,
    InProgress,
    Failed,
}

impl Progress {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Progress::Pending => "Pending",
            Progress::InProgress => "In Progress",
            Progress::Failed => "Failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Progress::Pending),
            "In Progress" => Some(Progress::InProgress),
            "Failed" => Some(Progress::Failed),
            _ => None,
        }
    }
}

/// A row of the `products` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    /// Canonical product name, the deduplication key.
    pub name: String,
    /// Catalog identifier used to build the download URL.
    pub id: String,
    pub attempts: u32,
    /// `None` when the stored text is not a known progress value.
    pub progress: Option<Progress>,
    /// UTC, `YYYY-MM-DD HH:MM:SS`.
    pub created: String,
    pub modified: String,
}

/// A product discovered in the catalog, ready to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub id: String,
    pub name: String,
}

impl NewProduct {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A work item that was moved to `In Progress` by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeasedProduct {
    pub id: String,
    pub name: String,
}

/// Outcome of one executor batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Products whose artifact was found in the staging area.
    pub completed: Vec<LeasedProduct>,
    /// Products to hand back to the queue for another attempt.
    pub failed: Vec<LeasedProduct>,
    /// Completed products whose artifact could not be moved to its final
    /// location. These are still reported as complete and are also listed
    /// in `completed`.
    pub unmoved: Vec<LeasedProduct>,
}

/// Outcome of stale lease recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset_to_pending: usize,
    pub quarantined: usize,
}

/// Row counts per progress value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress
    }
}

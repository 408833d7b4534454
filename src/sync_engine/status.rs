//! Snapshot of a mission's sync state for the `status` command.

use super::failure_ledger::FailureLedger;
use super::queue_store::WorkQueueStore;
use crate::config::CursorStore;
use super::catalog_client::format_timestamp;
use super::mission::Mission;
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub mission: Mission,
    /// `None` when the cursor could not be read.
    pub cursor: Option<String>,
    pub pending: usize,
    pub in_progress: usize,
    pub failed: usize,
}

impl StatusReport {
    pub fn collect(
        mission: Mission,
        queue: &dyn WorkQueueStore,
        ledger: &FailureLedger,
        cursor: &dyn CursorStore,
    ) -> Result<Self> {
        let counts = queue.counts()?;
        let cursor = match cursor.load() {
            Ok(ts) => Some(format_timestamp(&ts)),
            Err(e) => {
                warn!("Could not read cursor: {:#}", e);
                None
            }
        };
        Ok(Self {
            mission,
            cursor,
            pending: counts.pending,
            in_progress: counts.in_progress,
            failed: ledger.len()?,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mission:     {}", self.mission)?;
        writeln!(
            f,
            "cursor:      {}",
            self.cursor.as_deref().unwrap_or("unknown")
        )?;
        writeln!(f, "pending:     {}", self.pending)?;
        writeln!(f, "in progress: {}", self.in_progress)?;
        write!(f, "failed:      {}", self.failed)
    }
}

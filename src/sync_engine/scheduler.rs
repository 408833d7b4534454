//! Scheduler loop.
//!
//! One cycle: recover stale leases, drain the queue batch by batch, and when
//! the queue is empty query the next catalog window. The loop stops at the
//! first state transition after the wall-clock budget ran out, so a batch or
//! query that has started always finishes.

use super::catalog_client::{format_timestamp, CatalogClient, QueryWindow};
use super::executor::DownloadExecutor;
use super::failure_ledger::FailureLedger;
use super::queue_store::WorkQueueStore;
use crate::config::CursorStore;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::ValueEnum;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SyncMode {
    /// Query and download.
    #[default]
    Sync,
    /// Only discover products and fill the queue.
    #[value(name = "query")]
    QueryOnly,
    /// Only work through the queue.
    #[value(name = "download")]
    DownloadOnly,
}

impl SyncMode {
    fn queries(&self) -> bool {
        !matches!(self, SyncMode::DownloadOnly)
    }

    fn downloads(&self) -> bool {
        !matches!(self, SyncMode::QueryOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Recovering,
    Draining,
    Querying,
    /// The next window is too recent; wait before asking again.
    Deferred,
    /// Download-only mode with nothing to do.
    Idle,
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode: SyncMode,
    pub max_runtime: Duration,
    pub time_window: ChronoDuration,
    pub time_step: ChronoDuration,
    /// Products leased per batch.
    pub batch_size: usize,
    pub limit_download_attempts: u32,
    pub stale_lease_threshold: Duration,
    /// Pause in download-only mode when the queue is empty.
    pub idle_sleep: Duration,
}

pub struct Scheduler {
    queue: Arc<dyn WorkQueueStore>,
    ledger: Arc<FailureLedger>,
    catalog: Arc<CatalogClient>,
    executor: Arc<DownloadExecutor>,
    cursor: Arc<dyn CursorStore>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn WorkQueueStore>,
        ledger: Arc<FailureLedger>,
        catalog: Arc<CatalogClient>,
        executor: Arc<DownloadExecutor>,
        cursor: Arc<dyn CursorStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            ledger,
            catalog,
            executor,
            cursor,
            settings,
        }
    }

    pub async fn run(&self) -> Result<SyncExit> {
        let started = Instant::now();
        info!(
            "Starting {:?} run with a budget of {:?}",
            self.settings.mode, self.settings.max_runtime
        );

        let mut state = SyncState::Recovering;
        loop {
            let next = match state {
                SyncState::Recovering => self.recover()?,
                SyncState::Draining => self.drain_one_batch().await?,
                SyncState::Querying => self.query_next_window().await?,
                SyncState::Deferred => {
                    let half_window = (self.settings.time_window / 2)
                        .to_std()
                        .unwrap_or_default();
                    self.sleep_within_budget(half_window, started).await;
                    SyncState::Querying
                }
                SyncState::Idle => {
                    info!(
                        "Queue is empty, sleeping for {:?}",
                        self.settings.idle_sleep
                    );
                    self.sleep_within_budget(self.settings.idle_sleep, started)
                        .await;
                    SyncState::Recovering
                }
                SyncState::Exiting => {
                    info!("Run budget used up after {:?}, exiting", started.elapsed());
                    return Ok(SyncExit::BudgetExhausted);
                }
            };

            state = if started.elapsed() >= self.settings.max_runtime {
                SyncState::Exiting
            } else {
                next
            };
            debug!("Scheduler state: {:?}", state);
        }
    }

    fn recover(&self) -> Result<SyncState> {
        if !self.settings.mode.downloads() {
            return Ok(SyncState::Querying);
        }
        let report = self.queue.recover_stale(
            &self.ledger,
            self.settings.stale_lease_threshold,
            self.settings.limit_download_attempts,
        )?;
        if report.reset_to_pending > 0 || report.quarantined > 0 {
            info!(
                "Stale leases: {} back to pending, {} moved to the failure ledger",
                report.reset_to_pending, report.quarantined
            );
        }
        self.queue
            .quarantine(&self.ledger, self.settings.limit_download_attempts)?;
        Ok(SyncState::Draining)
    }

    fn after_empty_queue(&self) -> SyncState {
        if self.settings.mode.queries() {
            SyncState::Querying
        } else {
            SyncState::Idle
        }
    }

    async fn drain_one_batch(&self) -> Result<SyncState> {
        let pending = self.queue.count_pending()?;
        if pending == 0 {
            return Ok(self.after_empty_queue());
        }

        let batch = self.queue.lease(self.settings.batch_size)?;
        if batch.is_empty() {
            return Ok(self.after_empty_queue());
        }
        info!("{} products pending, leased {}", pending, batch.len());

        let report = self.executor.run(&batch).await?;
        self.queue.complete(&report.completed)?;
        self.queue.retry(&report.failed)?;
        self.queue
            .quarantine(&self.ledger, self.settings.limit_download_attempts)?;
        Ok(SyncState::Draining)
    }

    async fn query_next_window(&self) -> Result<SyncState> {
        let start = self.cursor.load()?;
        let window = QueryWindow::from_cursor(start, self.settings.time_window);
        if self.catalog.should_defer(&window, Utc::now()) {
            info!(
                "Window ending {} is not old enough to query yet",
                format_timestamp(&window.end)
            );
            return Ok(SyncState::Deferred);
        }

        let report = self.catalog.discover_window(&window, self.queue.as_ref()).await?;
        if report.abandoned {
            error!(
                "Moving past window {} - {} with incomplete results",
                format_timestamp(&window.start),
                format_timestamp(&window.end)
            );
        }
        self.cursor.store(window.start + self.settings.time_step)?;

        Ok(if self.settings.mode.downloads() {
            SyncState::Recovering
        } else {
            SyncState::Querying
        })
    }

    async fn sleep_within_budget(&self, wanted: Duration, started: Instant) {
        let remaining = self.settings.max_runtime.saturating_sub(started.elapsed());
        let nap = wanted.min(remaining);
        if !nap.is_zero() {
            tokio::time::sleep(nap).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(SyncMode::Sync.queries() && SyncMode::Sync.downloads());
        assert!(SyncMode::QueryOnly.queries() && !SyncMode::QueryOnly.downloads());
        assert!(!SyncMode::DownloadOnly.queries() && SyncMode::DownloadOnly.downloads());
    }

    #[test]
    fn test_mode_cli_names() {
        assert_eq!(
            SyncMode::from_str("query", false).unwrap(),
            SyncMode::QueryOnly
        );
        assert_eq!(
            SyncMode::from_str("download", false).unwrap(),
            SyncMode::DownloadOnly
        );
        assert_eq!(SyncMode::from_str("sync", false).unwrap(), SyncMode::Sync);
    }
}

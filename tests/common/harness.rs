#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sentinel_sync::config::CursorStore;
use sentinel_sync::sync_engine::{
    CatalogClient, CatalogQuerySettings, CatalogSource, CredentialHolder, DatePartitionedResolver,
    DateFilter, DownloadExecutor, ExecutorSettings, FailureLedger, Mission, PathResolver,
    ProductFetcher, RetryPolicy, Scheduler, SchedulerSettings, SqliteWorkQueueStore,
    WorkQueueStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::constants::CATALOG_URL;
use super::fakes::{FakeTokenProvider, MemoryCursor};

/// Real SQLite stores in a temporary directory, plus builders for the
/// components that sit on top of them.
pub struct TestHarness {
    pub dir: TempDir,
    pub queue: Arc<SqliteWorkQueueStore>,
    pub ledger: Arc<FailureLedger>,
    pub tokens: Arc<FakeTokenProvider>,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            SqliteWorkQueueStore::open_or_recover(dir.path().join("db/s1_download_queue.db"))
                .unwrap(),
        );
        let ledger = Arc::new(
            FailureLedger::open_or_recover(dir.path().join("db/s1_download_failures.db")).unwrap(),
        );
        Self {
            dir,
            queue,
            ledger,
            tokens: Arc::new(FakeTokenProvider::new()),
        }
    }

    pub fn with_rejected_credentials() -> Self {
        Self {
            tokens: Arc::new(FakeTokenProvider::rejecting()),
            ..Self::new()
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.dir.path().join("db/s1_download_queue.db")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("products")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub fn resolver(&self) -> Arc<dyn PathResolver> {
        Arc::new(DatePartitionedResolver::new(self.output_dir(), Mission::S1))
    }

    pub fn catalog(&self, source: Arc<dyn CatalogSource>) -> CatalogClient {
        self.catalog_at(source, CATALOG_URL)
    }

    pub fn catalog_at(&self, source: Arc<dyn CatalogSource>, catalog_url: &str) -> CatalogClient {
        CatalogClient::new(
            source,
            self.resolver(),
            CatalogQuerySettings {
                catalog_url: catalog_url.to_string(),
                collection: "SENTINEL-1".to_string(),
                polygon: None,
                date_filter: DateFilter::ContentDate,
                products_per_page: 1000,
                time_delay: ChronoDuration::zero(),
                page_retry: RetryPolicy::new(2, Duration::from_millis(1)),
            },
        )
    }

    pub fn executor_with(
        &self,
        fetcher: Arc<dyn ProductFetcher>,
        resolver: Arc<dyn PathResolver>,
        attempts_per_batch: u32,
    ) -> DownloadExecutor {
        DownloadExecutor::new(
            fetcher,
            Arc::new(CredentialHolder::new(self.tokens.clone())),
            resolver,
            ExecutorSettings {
                tmp_dir: self.tmp_dir(),
                max_parallel_downloads: 4,
                download_retry: RetryPolicy::new(attempts_per_batch, Duration::from_millis(1)),
            },
        )
    }

    pub fn executor(&self, fetcher: Arc<dyn ProductFetcher>) -> DownloadExecutor {
        self.executor_with(fetcher, self.resolver(), 1)
    }

    pub fn scheduler(
        &self,
        source: Arc<dyn CatalogSource>,
        fetcher: Arc<dyn ProductFetcher>,
        cursor: Arc<MemoryCursor>,
        settings: SchedulerSettings,
    ) -> Scheduler {
        let queue: Arc<dyn WorkQueueStore> = self.queue.clone();
        let cursor: Arc<dyn CursorStore> = cursor;
        Scheduler::new(
            queue,
            self.ledger.clone(),
            Arc::new(self.catalog(source)),
            Arc::new(self.executor(fetcher)),
            cursor,
            settings,
        )
    }

    /// Where a downloaded Sentinel-1 product sensed on 2024-03-01 ends up.
    pub fn stored_path(&self, name: &str) -> PathBuf {
        self.output_dir()
            .join("Sentinel-1/2024/03/01")
            .join(format!("{}.zip", name))
    }

    pub fn staged_path(&self, name: &str) -> PathBuf {
        self.tmp_dir().join(format!("{}.zip", name))
    }
}

/// Scheduler settings with one-hour windows and the given run budget.
pub fn scheduler_settings(
    mode: sentinel_sync::sync_engine::SyncMode,
    budget: Duration,
) -> SchedulerSettings {
    SchedulerSettings {
        mode,
        max_runtime: budget,
        time_window: ChronoDuration::minutes(60),
        time_step: ChronoDuration::minutes(60),
        batch_size: 20,
        limit_download_attempts: 3,
        stale_lease_threshold: Duration::from_secs(180 * 60),
        idle_sleep: Duration::from_secs(600),
    }
}

/// A cursor whose first window is fully in the past and whose second window
/// reaches into the future, so a run queries exactly once.
pub fn cursor_one_window_behind() -> (Arc<MemoryCursor>, DateTime<Utc>) {
    let start = Utc::now() - ChronoDuration::minutes(90);
    (Arc::new(MemoryCursor::starting_at(start)), start)
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"").unwrap();
}

//! Download executor: runs one leased batch through a bounded worker pool.
//!
//! Workers share one `CredentialHolder`. A rejected token costs nothing from
//! the item's retry budget, every other failure costs one attempt. After the
//! pool drains, the staging directory is the source of truth: an item counts
//! as downloaded only if its file is there.

use super::credentials::{CredentialError, CredentialHolder};
use super::errors::SyncError;
use super::mission::{file_extension, sensing_identity};
use super::models::{BatchReport, LeasedProduct};
use super::product_fetcher::{FetchError, ProductFetcher};
use super::retry_policy::RetryPolicy;
use super::storage_paths::PathResolver;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// More consecutive token rejections than this for one item are counted as
/// a failed attempt.
const MAX_CONSECUTIVE_TOKEN_EXPIRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Staging directory for in-flight and finished downloads.
    pub tmp_dir: PathBuf,
    pub max_parallel_downloads: usize,
    /// Attempts per item within one batch, and the pause between them.
    pub download_retry: RetryPolicy,
}

pub struct DownloadExecutor {
    fetcher: Arc<dyn ProductFetcher>,
    credentials: Arc<CredentialHolder>,
    resolver: Arc<dyn PathResolver>,
    settings: ExecutorSettings,
}

impl DownloadExecutor {
    pub fn new(
        fetcher: Arc<dyn ProductFetcher>,
        credentials: Arc<CredentialHolder>,
        resolver: Arc<dyn PathResolver>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            fetcher,
            credentials,
            resolver,
            settings,
        }
    }

    /// `<tmp>/<name>.<ext>`.
    pub fn staging_path(&self, product: &LeasedProduct) -> PathBuf {
        self.settings.tmp_dir.join(format!(
            "{}.{}",
            product.name,
            file_extension(&product.name)
        ))
    }

    /// Download the batch. Returns an error only when the credentials were
    /// rejected (`SyncError::Auth`) or the staging directory is unusable.
    pub async fn run(&self, batch: &[LeasedProduct]) -> Result<BatchReport> {
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }
        tokio::fs::create_dir_all(&self.settings.tmp_dir)
            .await
            .with_context(|| format!("Failed to create staging directory {:?}", self.settings.tmp_dir))?;

        let width = self.settings.max_parallel_downloads.max(1);
        info!(
            "Downloading {} products with {} parallel workers",
            batch.len(),
            width
        );

        stream::iter(batch.iter())
            .map(|product| self.download_one(product))
            .buffer_unordered(width)
            .try_collect::<Vec<()>>()
            .await?;

        let mut report = BatchReport::default();
        for product in batch {
            let staged = self.staging_path(product);
            if !staged.is_file() {
                report.failed.push(product.clone());
                continue;
            }
            let identity = sensing_identity(&product.name);
            let target_dir = self.resolver.storage_dir(&identity);
            match move_artifact(&staged, &target_dir).await {
                Ok(target) => info!("Stored product {} at {:?}", product.name, target),
                Err(e) => {
                    error!(
                        "Downloaded product {} could not be moved to {:?}: {}. It is left in {:?}",
                        product.name, target_dir, e, staged
                    );
                    report.unmoved.push(product.clone());
                }
            }
            report.completed.push(product.clone());
        }

        info!(
            "Batch finished: {} downloaded, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Try one product until it downloads or its budget runs out. Only a
    /// credential rejection is returned as an error.
    async fn download_one(&self, product: &LeasedProduct) -> Result<()> {
        let destination = self.staging_path(product);
        let policy = &self.settings.download_retry;
        let mut failures = 0u32;
        let mut expiries = 0u32;

        loop {
            let token = match self.credentials.current().await {
                Ok(token) => token,
                Err(e) => {
                    fatal_if_rejected(&e)?;
                    failures += 1;
                    warn!("No access token for product {}: {}", product.name, e);
                    if self.out_of_attempts(product, failures).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self.fetcher.fetch(product, &token.bearer, &destination).await {
                Ok(()) => return Ok(()),
                Err(FetchError::TokenExpired) => {
                    expiries += 1;
                    if expiries > MAX_CONSECUTIVE_TOKEN_EXPIRIES {
                        expiries = 0;
                        failures += 1;
                        warn!(
                            "Product {} was refused {} fresh tokens in a row",
                            product.name, MAX_CONSECUTIVE_TOKEN_EXPIRIES
                        );
                        if self.out_of_attempts(product, failures).await {
                            return Ok(());
                        }
                        continue;
                    }
                    if let Err(e) = self.credentials.refresh(token.generation).await {
                        fatal_if_rejected(&e)?;
                        failures += 1;
                        warn!("Token refresh for product {} failed: {}", product.name, e);
                        if self.out_of_attempts(product, failures).await {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    expiries = 0;
                    failures += 1;
                    warn!(
                        "Attempt {}/{} for product {} failed: {}",
                        failures, policy.max_attempts, product.name, e
                    );
                    if self.out_of_attempts(product, failures).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// True when the item has no attempts left; otherwise waits out the
    /// retry delay.
    async fn out_of_attempts(&self, product: &LeasedProduct, failures: u32) -> bool {
        let policy = &self.settings.download_retry;
        if policy.should_retry(failures) {
            policy.pause().await;
            false
        } else {
            warn!(
                "Giving up on product {} for this batch after {} attempts",
                product.name, failures
            );
            true
        }
    }
}

fn fatal_if_rejected(e: &CredentialError) -> Result<()> {
    match e {
        CredentialError::Rejected(msg) => Err(SyncError::Auth(msg.clone()).into()),
        CredentialError::Unavailable(_) => Ok(()),
    }
}

/// Move `staged` into `target_dir`, keeping its file name. Falls back to copy
/// and delete when a rename is not possible (different filesystems).
async fn move_artifact(staged: &Path, target_dir: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(target_dir).await?;
    let file_name = staged.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "staged path has no file name")
    })?;
    let target = target_dir.join(file_name);
    if tokio::fs::rename(staged, &target).await.is_err() {
        tokio::fs::copy(staged, &target).await?;
        tokio::fs::remove_file(staged).await?;
    }
    Ok(target)
}

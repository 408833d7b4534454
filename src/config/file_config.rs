use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Keys accepted in `config.toml` and `<mission>_config.toml`. Every key is
/// optional in each file; the merged result is validated in `SyncSettings`.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    // Query cursor and window
    pub start_timestamp: Option<String>,
    pub time_window: Option<i64>,
    pub time_step: Option<i64>,
    pub time_delay: Option<i64>,

    // Catalog query
    pub max_query_attempts: Option<u32>,
    pub wait_time_between_failed_queries: Option<u64>,
    pub products_per_page: Option<u32>,
    pub collection: Option<String>,
    pub polygon: Option<String>,
    pub date_to_filter_by: Option<String>,

    // Downloads
    pub output_dir: Option<String>,
    pub tmp_storage_area: Option<String>,
    pub max_parallel_downloads: Option<usize>,
    pub max_retries_per_iteration: Option<u32>,
    pub wait_time_between_failed_downloads: Option<u64>,
    pub limit_download_attempts: Option<u32>,
    pub number_downloads_per_iteration: Option<usize>,

    // Databases
    pub product_download_queue_db: Option<String>,
    pub download_failures_db: Option<String>,

    // Credentials and endpoints
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub token_url: Option<String>,
    pub catalog_url: Option<String>,
    pub download_url: Option<String>,
    pub request_timeout_secs: Option<u64>,

    // Scheduler
    pub stale_lease_threshold_mins: Option<u64>,
    pub max_runtime_mins: Option<f64>,
    pub idle_sleep_secs: Option<u64>,
}

macro_rules! prefer {
    ($over:expr, $base:expr, $($field:ident),+ $(,)?) => {
        FileConfig {
            $($field: $over.$field.or($base.$field),)+
        }
    };
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Keys set in `over` win over keys set in `self`.
    pub fn merged_with(self, over: FileConfig) -> FileConfig {
        prefer!(
            over,
            self,
            start_timestamp,
            time_window,
            time_step,
            time_delay,
            max_query_attempts,
            wait_time_between_failed_queries,
            products_per_page,
            collection,
            polygon,
            date_to_filter_by,
            output_dir,
            tmp_storage_area,
            max_parallel_downloads,
            max_retries_per_iteration,
            wait_time_between_failed_downloads,
            limit_download_attempts,
            number_downloads_per_iteration,
            product_download_queue_db,
            download_failures_db,
            username,
            password,
            client_id,
            token_url,
            catalog_url,
            download_url,
            request_timeout_secs,
            stale_lease_threshold_mins,
            max_runtime_mins,
            idle_sleep_secs,
        )
    }
}

mod cursor;
mod file_config;

pub use cursor::{parse_timestamp, CursorStore, TomlCursorStore, CURSOR_KEY};
pub use file_config::FileConfig;

use crate::sync_engine::catalog_client::DateFilter;
use crate::sync_engine::errors::SyncError;
use crate::sync_engine::mission::Mission;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const GLOBAL_CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_CLIENT_ID: &str = "cdse-public";
pub const DEFAULT_TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
pub const DEFAULT_CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://download.dataspace.copernicus.eu/odata/v1";

pub const USERNAME_ENV: &str = "CDSE_USERNAME";
pub const PASSWORD_ENV: &str = "CDSE_PASSWORD";

pub fn mission_config_file(mission: Mission) -> String {
    format!("{}_config.toml", mission.as_str())
}

/// Credentials taken from the environment, used when the files have none.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var(USERNAME_ENV).ok().filter(|s| !s.is_empty()),
            password: std::env::var(PASSWORD_ENV).ok().filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub mission: Mission,
    /// File holding the query cursor.
    pub mission_config_path: PathBuf,

    // Query cursor and window
    pub start_timestamp: DateTime<Utc>,
    pub time_window: ChronoDuration,
    pub time_step: ChronoDuration,
    pub time_delay: ChronoDuration,

    // Catalog query
    pub max_query_attempts: u32,
    pub wait_time_between_failed_queries: Duration,
    pub products_per_page: u32,
    pub collection: String,
    pub polygon: Option<String>,
    pub date_filter: DateFilter,

    // Downloads
    pub output_dir: PathBuf,
    pub tmp_storage_area: PathBuf,
    pub max_parallel_downloads: usize,
    pub max_retries_per_iteration: u32,
    pub wait_time_between_failed_downloads: Duration,
    pub limit_download_attempts: u32,
    pub number_downloads_per_iteration: usize,

    // Databases
    pub product_download_queue_db: PathBuf,
    pub download_failures_db: PathBuf,

    // Credentials and endpoints
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub token_url: String,
    pub catalog_url: String,
    pub download_url: String,
    pub request_timeout: Duration,

    // Scheduler
    pub stale_lease_threshold: Duration,
    pub max_runtime: Duration,
    pub idle_sleep: Duration,
}

impl SyncSettings {
    /// Read `<config_dir>/config.toml` (optional) and
    /// `<config_dir>/<mission>_config.toml` (required) and resolve them.
    /// Every failure is reported as `SyncError::Config`.
    pub fn load(config_dir: &Path, mission: Mission, env: &EnvCredentials) -> Result<Self> {
        Self::load_files(config_dir, mission, env)
            .map_err(|e| SyncError::Config(format!("{:#}", e)).into())
    }

    fn load_files(config_dir: &Path, mission: Mission, env: &EnvCredentials) -> Result<Self> {
        let (mission_path, file) = read_merged(config_dir, mission)?;
        Self::resolve(mission, mission_path, file, env)
    }

    /// Apply defaults to the merged file config and validate it.
    pub fn resolve(
        mission: Mission,
        mission_config_path: PathBuf,
        file: FileConfig,
        env: &EnvCredentials,
    ) -> Result<Self> {
        let (product_download_queue_db, download_failures_db) = database_paths(mission, &file)?;
        let start_timestamp = match file.start_timestamp.as_deref() {
            Some(s) => parse_timestamp(s)?,
            None => bail!("start_timestamp must be set in {:?}", mission_config_path),
        };

        let time_window_mins = file.time_window.unwrap_or(60);
        if time_window_mins <= 0 {
            bail!("time_window must be positive, got {}", time_window_mins);
        }
        let time_step_mins = file.time_step.unwrap_or(time_window_mins);
        if time_step_mins <= 0 {
            bail!("time_step must be positive, got {}", time_step_mins);
        }
        let time_delay_hours = file.time_delay.unwrap_or(0);
        if time_delay_hours < 0 {
            bail!("time_delay cannot be negative, got {}", time_delay_hours);
        }

        let date_filter = match file.date_to_filter_by.as_deref() {
            None => DateFilter::ContentDate,
            Some(s) => match DateFilter::from_config_str(s) {
                Some(filter) => filter,
                None => bail!(
                    "Invalid date_to_filter_by {:?}, expected ContentDate or PublicationDate",
                    s
                ),
            },
        };

        let products_per_page = file.products_per_page.unwrap_or(1000);
        if products_per_page == 0 {
            bail!("products_per_page must be at least 1");
        }

        let output_dir = file
            .output_dir
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("output_dir must be specified"))?;
        let tmp_storage_area = file
            .tmp_storage_area
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("tmp_storage_area must be specified"))?;

        let max_parallel_downloads = file.max_parallel_downloads.unwrap_or(4);
        if max_parallel_downloads == 0 {
            bail!("max_parallel_downloads must be at least 1");
        }
        let number_downloads_per_iteration = file.number_downloads_per_iteration.unwrap_or(20);
        if number_downloads_per_iteration == 0 {
            bail!("number_downloads_per_iteration must be at least 1");
        }
        let limit_download_attempts = file.limit_download_attempts.unwrap_or(3);
        if limit_download_attempts == 0 {
            bail!("limit_download_attempts must be at least 1");
        }

        let username = file
            .username
            .filter(|s| !s.is_empty())
            .or_else(|| env.username.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("username must be set in the config or via {}", USERNAME_ENV)
            })?;
        let password = file
            .password
            .filter(|s| !s.is_empty())
            .or_else(|| env.password.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("password must be set in the config or via {}", PASSWORD_ENV)
            })?;

        let max_runtime_mins = file.max_runtime_mins.unwrap_or(59.5);
        if max_runtime_mins <= 0.0 || !max_runtime_mins.is_finite() {
            bail!("max_runtime_mins must be positive, got {}", max_runtime_mins);
        }

        Ok(Self {
            mission,
            mission_config_path,
            start_timestamp,
            time_window: ChronoDuration::minutes(time_window_mins),
            time_step: ChronoDuration::minutes(time_step_mins),
            time_delay: ChronoDuration::hours(time_delay_hours),
            max_query_attempts: file.max_query_attempts.unwrap_or(3).max(1),
            wait_time_between_failed_queries: Duration::from_secs(
                file.wait_time_between_failed_queries.unwrap_or(30),
            ),
            products_per_page,
            collection: file
                .collection
                .unwrap_or_else(|| mission.descriptor().collection.to_string()),
            polygon: file.polygon.filter(|p| !p.trim().is_empty()),
            date_filter,
            output_dir,
            tmp_storage_area,
            max_parallel_downloads,
            max_retries_per_iteration: file.max_retries_per_iteration.unwrap_or(3).max(1),
            wait_time_between_failed_downloads: Duration::from_secs(
                file.wait_time_between_failed_downloads.unwrap_or(1),
            ),
            limit_download_attempts,
            number_downloads_per_iteration,
            product_download_queue_db,
            download_failures_db,
            username,
            password,
            client_id: file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            token_url: file
                .token_url
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            catalog_url: file
                .catalog_url
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            download_url: file
                .download_url
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_URL.to_string()),
            request_timeout: Duration::from_secs(file.request_timeout_secs.unwrap_or(300)),
            stale_lease_threshold: Duration::from_secs(
                file.stale_lease_threshold_mins.unwrap_or(180) * 60,
            ),
            max_runtime: Duration::from_secs_f64(max_runtime_mins * 60.0),
            idle_sleep: Duration::from_secs(file.idle_sleep_secs.unwrap_or(600)),
        })
    }
}

/// Global file (optional) merged under the mission file (required).
fn read_merged(config_dir: &Path, mission: Mission) -> Result<(PathBuf, FileConfig)> {
    let global_path = config_dir.join(GLOBAL_CONFIG_FILE);
    let mission_path = config_dir.join(mission_config_file(mission));

    let global = if global_path.exists() {
        info!("Loading config from {:?}", global_path);
        FileConfig::load(&global_path)?
    } else {
        FileConfig::default()
    };
    if !mission_path.exists() {
        bail!("Mission config file not found: {:?}", mission_path);
    }
    info!("Loading mission config from {:?}", mission_path);
    let mission_file = FileConfig::load(&mission_path)?;

    Ok((mission_path, global.merged_with(mission_file)))
}

fn database_paths(mission: Mission, file: &FileConfig) -> Result<(PathBuf, PathBuf)> {
    let db_dir = PathBuf::from("db");
    let queue = file
        .product_download_queue_db
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| db_dir.join(format!("{}_download_queue.db", mission.as_str())));
    let failures = file
        .download_failures_db
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| db_dir.join(format!("{}_download_failures.db", mission.as_str())));
    if queue == failures {
        bail!("product_download_queue_db and download_failures_db must be different files");
    }
    Ok((queue, failures))
}

/// What the `status` command needs: where the cursor and the two databases
/// live. Credentials and download settings are not required.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSettings {
    pub mission: Mission,
    pub mission_config_path: PathBuf,
    pub product_download_queue_db: PathBuf,
    pub download_failures_db: PathBuf,
}

impl StatusSettings {
    /// Failures are reported as `SyncError::Config`.
    pub fn load(config_dir: &Path, mission: Mission) -> Result<Self> {
        let load = || -> Result<Self> {
            let (mission_config_path, file) = read_merged(config_dir, mission)?;
            Self::resolve(mission, mission_config_path, &file)
        };
        load().map_err(|e| SyncError::Config(format!("{:#}", e)).into())
    }

    pub fn resolve(mission: Mission, mission_config_path: PathBuf, file: &FileConfig) -> Result<Self> {
        let (product_download_queue_db, download_failures_db) = database_paths(mission, file)?;
        Ok(Self {
            mission,
            mission_config_path,
            product_download_queue_db,
            download_failures_db,
        })
    }
}

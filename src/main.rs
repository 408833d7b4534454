use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sentinel_sync::config::{EnvCredentials, StatusSettings, SyncSettings, TomlCursorStore};
use sentinel_sync::sync_engine::{
    exit_code_for, CatalogClient, CatalogQuerySettings, CredentialHolder, DatePartitionedResolver,
    DownloadExecutor, ExecutorSettings, FailureLedger, HttpCatalogSource, HttpProductFetcher,
    HttpTokenProvider, Mission, RetryPolicy, Scheduler, SchedulerSettings, SqliteWorkQueueStore,
    StatusReport, SyncError, SyncExit, SyncMode,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir().context("Error resolving current directory")?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a local mirror of Sentinel products", subcommand_negates_reqs = true)]
struct CliArgs {
    #[command(subcommand)]
    command: Option<Command>,

    /// The mission to synchronize.
    #[clap(long, required = true)]
    mission: Option<Mission>,

    /// Directory holding config.toml and <mission>_config.toml.
    #[clap(long, default_value = "config", value_parser = parse_path)]
    config_dir: PathBuf,

    /// What the run should do.
    #[clap(long, value_enum, default_value_t = SyncMode::Sync)]
    mode: SyncMode,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print queue, ledger and cursor state for a mission.
    Status {
        #[clap(long)]
        mission: Mission,

        #[clap(long, default_value = "config", value_parser = parse_path)]
        config_dir: PathBuf,

        /// Print the report as JSON.
        #[clap(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .init();

    let outcome = match cli_args.command {
        Some(Command::Status {
            mission,
            config_dir,
            json,
        }) => print_status(mission, &config_dir, json),
        None => run_sync(cli_args.mission, &cli_args.config_dir, cli_args.mode).await,
    };

    if let Err(err) = outcome {
        error!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn open_stores(settings: &SyncSettings) -> Result<(SqliteWorkQueueStore, FailureLedger)> {
    let open = || -> Result<_> {
        let queue = SqliteWorkQueueStore::open_or_recover(&settings.product_download_queue_db)?;
        let ledger = FailureLedger::open_or_recover(&settings.download_failures_db)?;
        Ok((queue, ledger))
    };
    open().map_err(|e| SyncError::Storage(format!("{:#}", e)).into())
}

/// Read-only: needs no credentials and never resets a damaged database.
fn print_status(mission: Mission, config_dir: &std::path::Path, json: bool) -> Result<()> {
    let settings = StatusSettings::load(config_dir, mission)?;
    let queue = SqliteWorkQueueStore::new(&settings.product_download_queue_db)
        .map_err(|e| SyncError::Storage(format!("{:#}", e)))?;
    let ledger = FailureLedger::open(&settings.download_failures_db)
        .map_err(|e| SyncError::Storage(format!("{:#}", e)))?;
    let cursor = TomlCursorStore::new(&settings.mission_config_path);

    let report = StatusReport::collect(mission, &queue, &ledger, &cursor)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn run_sync(mission: Option<Mission>, config_dir: &std::path::Path, mode: SyncMode) -> Result<()> {
    let mission =
        mission.ok_or_else(|| SyncError::Config("--mission is required".to_string()))?;
    let settings = SyncSettings::load(config_dir, mission, &EnvCredentials::from_env())?;
    info!(
        "Syncing {} ({}) into {:?}",
        mission, settings.collection, settings.output_dir
    );

    let (queue, ledger) = open_stores(&settings)?;
    let resolver = Arc::new(DatePartitionedResolver::new(&settings.output_dir, mission));

    let token_provider = HttpTokenProvider::new(
        settings.token_url.clone(),
        settings.client_id.clone(),
        settings.username.clone(),
        settings.password.clone(),
        settings.request_timeout,
    )?;
    let credentials = Arc::new(CredentialHolder::new(Arc::new(token_provider)));

    let catalog = CatalogClient::new(
        Arc::new(HttpCatalogSource::new(settings.request_timeout)?),
        resolver.clone(),
        CatalogQuerySettings {
            catalog_url: settings.catalog_url.clone(),
            collection: settings.collection.clone(),
            polygon: settings.polygon.clone(),
            date_filter: settings.date_filter,
            products_per_page: settings.products_per_page,
            time_delay: settings.time_delay,
            page_retry: RetryPolicy::new(
                settings.max_query_attempts,
                settings.wait_time_between_failed_queries,
            ),
        },
    );

    let executor = DownloadExecutor::new(
        Arc::new(HttpProductFetcher::new(
            settings.download_url.clone(),
            settings.request_timeout,
        )?),
        credentials,
        resolver,
        ExecutorSettings {
            tmp_dir: settings.tmp_storage_area.clone(),
            max_parallel_downloads: settings.max_parallel_downloads,
            download_retry: RetryPolicy::new(
                settings.max_retries_per_iteration,
                settings.wait_time_between_failed_downloads,
            ),
        },
    );

    let scheduler = Scheduler::new(
        Arc::new(queue),
        Arc::new(ledger),
        Arc::new(catalog),
        Arc::new(executor),
        Arc::new(TomlCursorStore::new(&settings.mission_config_path)),
        SchedulerSettings {
            mode,
            max_runtime: settings.max_runtime,
            time_window: settings.time_window,
            time_step: settings.time_step,
            batch_size: settings.number_downloads_per_iteration,
            limit_download_attempts: settings.limit_download_attempts,
            stale_lease_threshold: settings.stale_lease_threshold,
            idle_sleep: settings.idle_sleep,
        },
    );

    match scheduler.run().await? {
        SyncExit::BudgetExhausted => info!("Run finished"),
    }
    Ok(())
}

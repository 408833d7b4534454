//! Sentinel product sync engine.
//!
//! A catalog query fills a SQLite work queue; a pool of download workers
//! drains it. Products that keep failing are moved to a separate failure
//! ledger. The scheduler ties both halves together under a run budget.

pub mod catalog_client;
pub mod credentials;
pub mod errors;
pub mod executor;
pub mod failure_ledger;
pub mod mission;
pub mod models;
mod product_db;
pub mod product_fetcher;
pub mod queue_store;
pub mod retry_policy;
pub mod scheduler;
mod schema;
pub mod status;
pub mod storage_paths;

pub use catalog_client::{
    CatalogClient, CatalogQuerySettings, CatalogSource, DateFilter, HttpCatalogSource, QueryWindow,
};
pub use credentials::{CredentialHolder, HttpTokenProvider, TokenProvider};
pub use errors::{exit_code_for, SyncError};
pub use executor::{DownloadExecutor, ExecutorSettings};
pub use failure_ledger::FailureLedger;
pub use mission::Mission;
pub use models::*;
pub use product_fetcher::{HttpProductFetcher, ProductFetcher};
pub use queue_store::{SqliteWorkQueueStore, WorkQueueStore};
pub use retry_policy::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerSettings, SyncExit, SyncMode};
pub use schema::PRODUCTS_TABLE;
pub use status::StatusReport;
pub use storage_paths::{DatePartitionedResolver, FlatResolver, PathResolver};

//! Sentinel Sync Library
//!
//! Exposes the sync engine modules to the binary and to the integration tests.

pub mod config;
pub mod sqlite_persistence;
pub mod sync_engine;

pub use config::{SyncSettings, TomlCursorStore};
pub use sync_engine::{Scheduler, SyncError, SyncMode};

//! Common test infrastructure
//!
//! Fakes for every network-facing seam of the sync engine plus a harness
//! that wires them to real SQLite stores in a temporary directory.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{FakeCatalogSource, TestHarness, S1_PRODUCT_A};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = TestHarness::new();
//!     let catalog = harness.catalog(Arc::new(FakeCatalogSource::with_names(&[S1_PRODUCT_A])));
//! }
//! ```

mod constants;
mod fakes;
mod harness;
mod local_server;

#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fakes::{FakeCatalogSource, FakeFetcher, FakeTokenProvider, FetchBehavior, MemoryCursor};
#[allow(unused_imports)]
pub use harness::{cursor_one_window_behind, scheduler_settings, touch, TestHarness};
#[allow(unused_imports)]
pub use local_server::{LocalServer, RecordedRequest, Reply};

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sentinel_sync::config::CursorStore;
use sentinel_sync::sync_engine::catalog_client::{CatalogPage, CatalogRecord, CatalogSource};
use sentinel_sync::sync_engine::credentials::{AccessToken, CredentialError, TokenProvider};
use sentinel_sync::sync_engine::product_fetcher::{FetchError, ProductFetcher};
use sentinel_sync::sync_engine::LeasedProduct;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::constants::catalog_id;

/// Serves the same single page to every request.
pub struct FakeCatalogSource {
    records: Vec<CatalogRecord>,
    failing: bool,
    requests: Mutex<Vec<String>>,
}

impl FakeCatalogSource {
    pub fn with_names(names: &[&str]) -> Self {
        Self {
            records: names
                .iter()
                .map(|name| CatalogRecord {
                    id: catalog_id(name),
                    name: format!("{}.SAFE", name),
                })
                .collect(),
            failing: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request fails.
    pub fn unreachable() -> Self {
        Self {
            failing: true,
            ..Self::with_names(&[])
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogSource for FakeCatalogSource {
    async fn fetch_page(&self, url: &str) -> Result<CatalogPage> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.failing {
            bail!("catalog unreachable");
        }
        Ok(CatalogPage {
            value: self.records.clone(),
            next_link: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBehavior {
    Succeed,
    Fail,
}

/// Writes a small payload for products that succeed, returns 503 for the
/// ones configured to fail.
pub struct FakeFetcher {
    default: FetchBehavior,
    overrides: HashMap<String, FetchBehavior>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn succeeding() -> Self {
        Self {
            default: FetchBehavior::Succeed,
            overrides: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(mut self, name: &str, behavior: FetchBehavior) -> Self {
        self.overrides.insert(name.to_string(), behavior);
        self
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ProductFetcher for FakeFetcher {
    async fn fetch(
        &self,
        product: &LeasedProduct,
        _bearer: &str,
        destination: &Path,
    ) -> Result<(), FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(product.name.clone())
            .or_insert(0) += 1;
        let behavior = self
            .overrides
            .get(&product.name)
            .copied()
            .unwrap_or(self.default);
        match behavior {
            FetchBehavior::Succeed => {
                tokio::fs::write(destination, product.id.as_bytes()).await?;
                Ok(())
            }
            FetchBehavior::Fail => Err(FetchError::Http(503)),
        }
    }
}

pub struct FakeTokenProvider {
    issued: AtomicUsize,
    reject: bool,
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self {
            issued: AtomicUsize::new(0),
            reject: false,
        }
    }

    /// Refuses every grant, like a token endpoint given a wrong password.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn issue(&self) -> AccessToken {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        AccessToken::new(
            format!("token-{}", n),
            Some(format!("refresh-{}", n)),
            Duration::from_secs(600),
        )
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn obtain(&self) -> Result<AccessToken, CredentialError> {
        if self.reject {
            return Err(CredentialError::Rejected("invalid_grant".to_string()));
        }
        Ok(self.issue())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<AccessToken, CredentialError> {
        if self.reject {
            return Err(CredentialError::Rejected("invalid_grant".to_string()));
        }
        Ok(self.issue())
    }
}

/// Cursor kept in memory, remembering every value stored.
pub struct MemoryCursor {
    history: Mutex<Vec<DateTime<Utc>>>,
}

impl MemoryCursor {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            history: Mutex::new(vec![start]),
        }
    }

    pub fn history(&self) -> Vec<DateTime<Utc>> {
        self.history.lock().unwrap().clone()
    }
}

impl CursorStore for MemoryCursor {
    fn load(&self) -> Result<DateTime<Utc>> {
        match self.history.lock().unwrap().last() {
            Some(ts) => Ok(*ts),
            None => bail!("cursor is empty"),
        }
    }

    fn store(&self, next: DateTime<Utc>) -> Result<()> {
        self.history.lock().unwrap().push(next);
        Ok(())
    }
}

//! Catalog queries: one time window at a time, following result pages, and
//! turning the records into new work items.

use super::mission::{canonical_name, sensing_identity};
use super::models::NewProduct;
use super::queue_store::WorkQueueStore;
use super::retry_policy::RetryPolicy;
use super::storage_paths::{exists_on_disk, PathResolver};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Timestamp format of the cursor and of the catalog filter.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Which product date the temporal filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DateFilter {
    ContentDate,
    PublicationDate,
}

impl DateFilter {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "ContentDate" => Some(DateFilter::ContentDate),
            "PublicationDate" => Some(DateFilter::PublicationDate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    pub fn from_cursor(start: DateTime<Utc>, time_window: ChronoDuration) -> Self {
        Self {
            start,
            end: start + time_window,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogQuerySettings {
    /// Base of the OData API, e.g. `https://catalogue.dataspace.copernicus.eu/odata/v1`.
    pub catalog_url: String,
    pub collection: String,
    /// WKT polygon, passed to the server-side intersection filter.
    pub polygon: Option<String>,
    pub date_filter: DateFilter,
    pub products_per_page: u32,
    /// Windows ending later than `now - time_delay` are not queried yet.
    pub time_delay: ChronoDuration,
    pub page_retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub filter: String,
    pub top: u32,
}

impl CatalogRequest {
    pub fn url(&self, base: &str) -> String {
        format!(
            "{}/Products?$filter={}&$top={}",
            base.trim_end_matches('/'),
            urlencoding::encode(&self.filter),
            self.top
        )
    }
}

/// One entry of a catalog result page. Only the fields the engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub value: Vec<CatalogRecord>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub records: Vec<CatalogRecord>,
    pub pages: usize,
    /// A page ran out of attempts and the pages after it were never read.
    pub abandoned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub found: usize,
    pub already_on_disk: usize,
    pub enqueued: usize,
    pub abandoned: bool,
}

/// Fetches one page of catalog results.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<CatalogPage>;
}

pub struct HttpCatalogSource {
    client: Client,
}

impl HttpCatalogSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch_page(&self, url: &str) -> Result<CatalogPage> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            bail!("Catalog query failed with status {}", response.status());
        }
        Ok(response.json().await?)
    }
}

pub struct CatalogClient {
    source: Arc<dyn CatalogSource>,
    resolver: Arc<dyn PathResolver>,
    settings: CatalogQuerySettings,
}

impl CatalogClient {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        resolver: Arc<dyn PathResolver>,
        settings: CatalogQuerySettings,
    ) -> Self {
        Self {
            source,
            resolver,
            settings,
        }
    }

    pub fn settings(&self) -> &CatalogQuerySettings {
        &self.settings
    }

    /// True while the window is too recent for the catalog to be complete.
    pub fn should_defer(&self, window: &QueryWindow, now: DateTime<Utc>) -> bool {
        window.end >= now - self.settings.time_delay
    }

    pub fn build_request(&self, window: &QueryWindow) -> CatalogRequest {
        let start = format_timestamp(&window.start);
        let end = format_timestamp(&window.end);
        let temporal = match self.settings.date_filter {
            DateFilter::ContentDate => format!(
                "ContentDate/Start gt {} and ContentDate/End lt {} and ",
                start, end
            ),
            DateFilter::PublicationDate => format!(
                "PublicationDate gt {} and PublicationDate lt {} and ",
                start, end
            ),
        };
        let spatial = match self.settings.polygon.as_deref() {
            Some(polygon) if !polygon.trim().is_empty() => format!(
                " and OData.CSC.Intersects(area=geography'SRID=4326;{}')",
                polygon
            ),
            _ => String::new(),
        };
        CatalogRequest {
            filter: format!(
                "{}Collection/Name eq '{}'{}",
                temporal, self.settings.collection, spatial
            ),
            top: self.settings.products_per_page,
        }
    }

    /// Read every page of the request. A page that keeps failing ends the
    /// query early; what was gathered up to then is still returned.
    pub async fn execute(&self, request: &CatalogRequest) -> QueryOutcome {
        let mut outcome = QueryOutcome::default();
        let mut next = Some(request.url(&self.settings.catalog_url));
        info!("Querying catalog: {}", request.filter);

        'pages: while let Some(url) = next.take() {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.source.fetch_page(&url).await {
                    Ok(page) => {
                        outcome.pages += 1;
                        outcome.records.extend(page.value);
                        next = page.next_link;
                        continue 'pages;
                    }
                    Err(e) => {
                        error!("Catalog page attempt {} failed: {:#}", attempts, e);
                        if !self.settings.page_retry.should_retry(attempts) {
                            outcome.abandoned = true;
                            break 'pages;
                        }
                        self.settings.page_retry.pause().await;
                    }
                }
            }
        }

        if outcome.abandoned {
            error!(
                "All attempts failed for a catalog page, {} records from {} pages kept and the rest of the window skipped",
                outcome.records.len(),
                outcome.pages
            );
        }
        outcome
    }

    /// Turn catalog records into work items, dropping products already on
    /// disk and repeated names.
    pub fn discover(&self, records: &[CatalogRecord]) -> (Vec<NewProduct>, usize) {
        let mut seen = HashSet::new();
        let mut already_on_disk = 0;
        let mut products = Vec::new();
        for record in records {
            let name = canonical_name(&record.name);
            if !seen.insert(name.clone()) {
                continue;
            }
            let identity = sensing_identity(&name);
            let dir = self.resolver.storage_dir(&identity);
            if exists_on_disk(&dir, &identity) {
                already_on_disk += 1;
                continue;
            }
            products.push(NewProduct::new(record.id.clone(), name));
        }
        (products, already_on_disk)
    }

    /// Query one window and enqueue what is new.
    pub async fn discover_window(
        &self,
        window: &QueryWindow,
        queue: &dyn WorkQueueStore,
    ) -> Result<DiscoveryReport> {
        let request = self.build_request(window);
        let outcome = self.execute(&request).await;
        let (products, already_on_disk) = self.discover(&outcome.records);
        let enqueued = queue.enqueue(&products)?;

        let report = DiscoveryReport {
            found: outcome.records.len(),
            already_on_disk,
            enqueued,
            abandoned: outcome.abandoned,
        };
        if report.found == 0 {
            info!(
                "No products found between {} and {}",
                format_timestamp(&window.start),
                format_timestamp(&window.end)
            );
        } else {
            info!(
                "Window {} - {}: {} products found, {} already on disk, {} enqueued",
                format_timestamp(&window.start),
                format_timestamp(&window.end),
                report.found,
                report.already_on_disk,
                report.enqueued
            );
        }
        if report.abandoned {
            warn!("Window results are incomplete, some products may be missed");
        }
        Ok(report)
    }
}

//! Product payload transport.

use super::models::LeasedProduct;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{redirect, Client, Response, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The bearer token was refused. Refresh and try again.
    #[error("access token expired")]
    TokenExpired,

    #[error("download failed with status {0}")]
    Http(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("gave up after {0} redirects")]
    TooManyRedirects(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads one product to `destination`.
#[async_trait]
pub trait ProductFetcher: Send + Sync {
    async fn fetch(
        &self,
        product: &LeasedProduct,
        bearer: &str,
        destination: &Path,
    ) -> Result<(), FetchError>;
}

/// Fetches `<download_url>/Products(<id>)/$value`.
///
/// Redirects are followed by hand so the bearer header goes along to every
/// hop. The body is streamed to `<destination>.part` and renamed into place
/// once complete, so a file at `destination` is always a whole download.
///
/// The timeout bounds connecting and every single read, not the whole
/// transfer: a multi-gigabyte body may stream for as long as it keeps moving.
pub struct HttpProductFetcher {
    client: Client,
    download_url: String,
}

impl HttpProductFetcher {
    pub fn new(download_url: String, stall_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(stall_timeout)
            .read_timeout(stall_timeout)
            .build()?;
        Ok(Self {
            client,
            download_url: download_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn product_url(&self, id: &str) -> String {
        format!("{}/Products({})/$value", self.download_url, id)
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut part = destination.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

#[async_trait]
impl ProductFetcher for HttpProductFetcher {
    async fn fetch(
        &self,
        product: &LeasedProduct,
        bearer: &str,
        destination: &Path,
    ) -> Result<(), FetchError> {
        let mut url =
            Url::parse(&self.product_url(&product.id)).map_err(|e| FetchError::Network(e.to_string()))?;
        info!("Downloading product {} from {}", product.name, url);

        let mut hops = 0;
        let response = loop {
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(bearer)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(FetchError::TokenExpired);
            }
            if !is_redirect(status) {
                if !status.is_success() {
                    return Err(FetchError::Http(status.as_u16()));
                }
                break response;
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects(MAX_REDIRECTS));
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::Network(format!("redirect {} without location", status)))?;
            url = url
                .join(location)
                .map_err(|e| FetchError::Network(format!("bad redirect location: {}", e)))?;
            debug!("Product {} redirected to {}", product.name, url);
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(destination);
        match store_body(response, &part, destination).await {
            Ok(written) => {
                info!("Downloaded product {} ({} bytes)", product.name, written);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

/// Stream the body into `part`, then rename it to `destination`.
async fn store_body(response: Response, part: &Path, destination: &Path) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Network(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(part, destination).await?;
    Ok(written)
}

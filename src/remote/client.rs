//! Remote Fetch Client
//!
//! Provides HTTP access to listing endpoints and image hosts.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use tracing::{debug, info, warn};

use super::errors::FetchError;
use super::types::{Listing, ListingItem};
use crate::config::CacheConfig;

/// User agent sent with every request; some image hosts reject bare clients
const USER_AGENT: &str = concat!("content-cache/", env!("CARGO_PKG_VERSION"));

/// Remote-fetch collaborator consumed by the cache
///
/// Implementations perform exactly one attempt per call.
pub trait RemoteFetcher: Send + Sync {
    /// Fetch one page of a source's listing
    fn fetch_listing<'a>(
        &'a self,
        source_id: &'a str,
        page: u32,
    ) -> BoxFuture<'a, Result<Listing, FetchError>>;

    /// Download the bytes behind `url`
    fn fetch_blob<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL listing paths are appended to
    api_base_url: String,
}

impl HttpFetcher {
    /// Create a fetcher against `api_base_url`
    ///
    /// # Arguments
    /// * `api_base_url` - Base URL of the listing API (no trailing slash needed)
    /// * `timeout` - Timeout applied to every request
    pub fn new(api_base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Request(format!("Failed to create HTTP client: {}", e)))?;

        let api_base_url = api_base_url.into().trim_end_matches('/').to_string();
        info!(api_base_url = %api_base_url, "Remote fetcher ready");

        Ok(Self {
            http_client,
            api_base_url,
        })
    }

    /// Create a fetcher from cache configuration
    pub fn from_config(config: &CacheConfig) -> Result<Self, FetchError> {
        Self::new(config.api_base_url.clone(), config.request_timeout)
    }

    /// Build the listing URL for a source page
    fn listing_url(&self, source_id: &str, page: u32) -> String {
        format!(
            "{}/{}/homepage?page={}",
            self.api_base_url,
            urlencoding::encode(source_id),
            page
        )
    }

    async fn get_listing(&self, source_id: &str, page: u32) -> Result<Listing, FetchError> {
        let url = self.listing_url(source_id, page);
        debug!(source = source_id, page, url = %url, "Fetching listing");

        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(source = source_id, page, status, "Listing request failed");
            return Err(FetchError::from_status(status, &body));
        }

        let items: Vec<ListingItem> = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        debug!(source = source_id, page, items = items.len(), "Fetched listing");
        Ok(items.into_iter().map(ListingItem::normalize).collect())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url = url, "Downloading blob");

        let response = self.http_client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(url = url, status, "Blob download failed");
            return Err(FetchError::from_status(status, &body));
        }

        let bytes = response.bytes().await?;

        debug!(url = url, size = bytes.len(), "Downloaded blob");
        Ok(bytes.to_vec())
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch_listing<'a>(
        &'a self,
        source_id: &'a str,
        page: u32,
    ) -> BoxFuture<'a, Result<Listing, FetchError>> {
        self.get_listing(source_id, page).boxed()
    }

    fn fetch_blob<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        self.download(url).boxed()
    }
}

//! Cache Manager - the single entry point callers hold
//!
//! Owns one metadata cache, one blob store and one prefetcher. Construct it
//! once at startup and pass it (or an `Arc` of it) to every consumer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{
    BlobHandle, BlobStore, BlobStoreStats, CacheError, MetadataCache, PrefetchReport, Prefetcher,
};
use crate::config::CacheConfig;
use crate::remote::{Listing, ListingKey, RemoteFetcher};

/// Tiered cache in front of a remote fetcher
pub struct CacheManager {
    config: CacheConfig,
    /// Listing pages by (source, page)
    listings: MetadataCache<ListingKey, Arc<Listing>>,
    /// Persistent image cache
    blobs: BlobStore,
    prefetcher: Prefetcher,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl CacheManager {
    /// Open the cache described by `config`, fetching misses through `fetcher`
    ///
    /// Runs the blob store's startup recovery and eviction pass.
    ///
    /// # Arguments
    /// * `config` - Cache location, limits and prefetch bound
    /// * `fetcher` - Remote source for listings and images
    ///
    /// # Returns
    /// The manager, or `CacheError::Storage` if the cache directory is unusable
    pub async fn open(
        config: CacheConfig,
        fetcher: Arc<dyn RemoteFetcher>,
    ) -> Result<Self, CacheError> {
        let blobs = BlobStore::open(&config).await?;
        let prefetcher = Prefetcher::new(blobs.clone(), Arc::clone(&fetcher), config.prefetch_limit);

        info!(
            cache_dir = %config.cache_dir.display(),
            metadata_capacity = config.metadata_capacity,
            "Cache manager ready"
        );

        Ok(Self {
            listings: MetadataCache::with_capacity(config.metadata_capacity),
            blobs,
            prefetcher,
            fetcher,
            config,
        })
    }

    /// Get a listing page, fetching it on a miss
    ///
    /// Failed fetches are not cached.
    pub async fn fetch_data(&self, source_id: &str, page: u32) -> Result<Arc<Listing>, CacheError> {
        let key = ListingKey::new(source_id, page);
        if let Some(listing) = self.listings.get(&key) {
            return Ok(listing);
        }

        let listing = Arc::new(self.fetcher.fetch_listing(source_id, page).await?);
        self.listings.put(key, Arc::clone(&listing));
        Ok(listing)
    }

    /// Local handle for a cached image, if present
    pub async fn get_cached_image(&self, url: &str) -> Option<BlobHandle> {
        self.blobs.lookup(url).await
    }

    /// Download `url` into the blob store
    ///
    /// Concurrent calls for the same URL share one download.
    pub async fn cache_image(&self, url: &str) -> Result<BlobHandle, CacheError> {
        let fetcher = Arc::clone(&self.fetcher);
        let remote_url = url.to_string();
        self.blobs
            .store_with(url, move || async move { fetcher.fetch_blob(&remote_url).await })
            .await
    }

    /// Get an image from cache or network, then prefetch the images after it
    ///
    /// `next_urls` is the explicit list of what the reader will likely view
    /// next; it is handed to the prefetcher once and never extended.
    ///
    /// # Arguments
    /// * `url` - Image to load
    /// * `next_urls` - Images to prefetch in the background, in reading order
    ///
    /// # Returns
    /// Handle to the local copy of `url`; prefetch failures never surface here
    pub async fn load_image(&self, url: &str, next_urls: &[String]) -> Result<BlobHandle, CacheError> {
        let handle = match self.get_cached_image(url).await {
            Some(handle) => handle,
            None => self.cache_image(url).await?,
        };

        if !next_urls.is_empty() {
            debug!(url = url, next = next_urls.len(), "Scheduling prefetch");
            // Fire and forget
            let _ = self.prefetch(next_urls.iter().cloned());
        }

        Ok(handle)
    }

    /// Prefetch images in the background
    pub fn prefetch<I>(&self, urls: I) -> JoinHandle<PrefetchReport>
    where
        I: IntoIterator<Item = String>,
    {
        self.prefetcher.prefetch(urls)
    }

    /// Clear both cache tiers
    ///
    /// Safe to call repeatedly.
    pub async fn clear_cache(&self) {
        self.listings.clear();
        let deleted = self.blobs.clear_all().await;
        info!(files = deleted, "Cache cleared");
    }

    /// Get blob store statistics
    pub fn stats(&self) -> BlobStoreStats {
        self.listings.log_metrics();
        self.blobs.stats()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn listings(&self) -> &MetadataCache<ListingKey, Arc<Listing>> {
        &self.listings
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

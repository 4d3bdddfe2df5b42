//! Content Cache - tiered cache for a content-browsing client
//!
//! Listing pages live in a small in-memory FIFO cache; downloaded images
//! live on disk behind a persisted index with age and size eviction.
//! Concurrent requests for one image share a single download, and callers
//! can prefetch the images they expect to need next.

pub mod cache;
pub mod config;
pub mod manager;
pub mod remote;

pub use cache::{BlobHandle, BlobStoreStats, CacheError, PrefetchReport};
pub use config::CacheConfig;
pub use manager::CacheManager;
pub use remote::{FetchError, HttpFetcher, Listing, ListingItem, ListingKey, RemoteFetcher};

//! Caching layer
//!
//! Two tiers: a volatile FIFO cache for listing pages and a persistent
//! disk cache for downloaded blobs with age/size eviction and prefetching.

pub mod blob_index;
pub mod blob_store;
pub mod errors;
pub mod eviction;
pub mod metadata;
pub mod prefetch;

pub use blob_index::{BlobIndex, BlobIndexEntry};
pub use blob_store::{BlobHandle, BlobStore, BlobStoreStats};
pub use errors::CacheError;
pub use eviction::{Eviction, EvictionPolicy, EvictionReason};
pub use metadata::MetadataCache;
pub use prefetch::{PrefetchReport, Prefetcher};

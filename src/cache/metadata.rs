//! Metadata Cache Implementation
//!
//! Bounded in-memory cache for small structured responses (listing pages).
//! Eviction is first-in-first-out: reads never reorder entries, and each
//! over-capacity insert evicts exactly one entry. Nothing survives the process.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::config::DEFAULT_METADATA_CAPACITY;

struct Entries<K, V> {
    values: HashMap<K, V>,
    /// Keys in insertion order, oldest first
    order: VecDeque<K>,
}

/// FIFO-bounded metadata cache
///
/// All operations are total; capacity is enforced by eviction, never by failure.
pub struct MetadataCache<K, V> {
    entries: Mutex<Entries<K, V>>,
    capacity: usize,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl<K, V> MetadataCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Create a new metadata cache with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_METADATA_CAPACITY)
    }

    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(Entries {
                values: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<K, V>> {
        // Entries are only ever replaced whole, so a poisoned guard still holds consistent data
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a cached payload
    ///
    /// Does not affect eviction order. Updates hit/miss counters.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.lock().values.get(key).cloned();
        match value {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, "Metadata cache HIT");
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, "Metadata cache MISS");
                None
            }
        }
    }

    /// Insert or replace a payload
    ///
    /// A replaced key keeps its original insertion position. When a new key
    /// pushes the cache over capacity, the single oldest entry is evicted.
    pub fn put(&self, key: K, value: V) {
        let evicted = {
            let mut entries = self.lock();
            if entries.values.insert(key.clone(), value).is_some() {
                None
            } else {
                entries.order.push_back(key.clone());
                if entries.order.len() > self.capacity {
                    let oldest = entries.order.pop_front();
                    if let Some(ref oldest) = oldest {
                        entries.values.remove(oldest);
                    }
                    oldest
                } else {
                    None
                }
            }
        };

        match evicted {
            Some(oldest) => debug!(key = ?key, evicted = ?oldest, "Cached metadata, evicted oldest"),
            None => debug!(key = ?key, "Cached metadata"),
        }
    }

    /// Drop a single entry
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.lock();
        if entries.values.remove(key).is_some() {
            entries.order.retain(|k| k != key);
            debug!(key = ?key, "Invalidated metadata entry");
        }
    }

    /// Clear all entries and reset counters
    pub fn clear(&self) {
        {
            let mut entries = self.lock();
            entries.values.clear();
            entries.order.clear();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared metadata cache");
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys currently cached, oldest first
    pub fn keys(&self) -> Vec<K> {
        self.lock().order.iter().cloned().collect()
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            entries = self.len(),
            capacity = self.capacity,
            "Metadata cache metrics"
        );
    }
}

impl<K, V> Default for MetadataCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

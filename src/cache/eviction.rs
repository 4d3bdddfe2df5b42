//! Eviction Policy
//!
//! Pure planning over the blob index: hard TTL first, then LRU against the
//! size budget. The store applies the plan; nothing here touches disk.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::blob_index::BlobIndexEntry;

/// Why an entry was selected for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Not accessed within the maximum age
    Expired,
    /// Less recently used than entries that already fill the size budget
    OverBudget,
}

/// One entry selected for removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub source_key: String,
    pub reason: EvictionReason,
}

/// Combined age/size eviction rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Size budget in bytes
    pub max_size: u64,
    /// Entries idle longer than this are always evicted
    pub max_age: Duration,
}

impl EvictionPolicy {
    pub fn new(max_size: u64, max_age: Duration) -> Self {
        Self { max_size, max_age }
    }

    fn is_expired(&self, entry: &BlobIndexEntry, now: DateTime<Utc>) -> bool {
        // Timestamps in the future (clock moved back) count as fresh
        now.signed_duration_since(entry.last_accessed_at)
            .to_std()
            .map(|age| age > self.max_age)
            .unwrap_or(false)
    }

    /// Select the entries to evict from `entries` (given in insertion order)
    ///
    /// 1. Every entry older than `max_age` goes, regardless of size.
    /// 2. Survivors are ranked most recently used first; on equal timestamps
    ///    the later insertion ranks first.
    /// 3. Walking that ranking, the first entry that would push the running
    ///    total past `max_size` and every entry after it are evicted.
    ///
    /// The top-ranked survivor is never evicted for size, so a single entry
    /// larger than the whole budget stays until something newer displaces it.
    pub fn plan(&self, entries: &[BlobIndexEntry], now: DateTime<Utc>) -> Vec<Eviction> {
        let mut evictions = Vec::new();
        let mut survivors: Vec<(usize, &BlobIndexEntry)> = Vec::with_capacity(entries.len());

        for (position, entry) in entries.iter().enumerate() {
            if self.is_expired(entry, now) {
                evictions.push(Eviction {
                    source_key: entry.source_key.clone(),
                    reason: EvictionReason::Expired,
                });
            } else {
                survivors.push((position, entry));
            }
        }

        survivors.sort_by(|(pos_a, a), (pos_b, b)| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| pos_b.cmp(pos_a))
        });

        let mut total: u64 = 0;
        let mut over_budget = false;
        for (rank, (_, entry)) in survivors.into_iter().enumerate() {
            if !over_budget {
                let next = total.saturating_add(entry.size_bytes);
                if next <= self.max_size || rank == 0 {
                    total = next;
                    continue;
                }
                over_budget = true;
            }
            evictions.push(Eviction {
                source_key: entry.source_key.clone(),
                reason: EvictionReason::OverBudget,
            });
        }

        evictions
    }
}

//! Prefetcher
//!
//! Warms the blob store with keys the caller expects to need next (the
//! following pages of a chapter, say). Runs in the background through the
//! store's normal coalescing path; failures never reach the caller.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use super::blob_store::BlobStore;
use crate::remote::RemoteFetcher;

/// Outcome of one prefetch request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Keys accepted after de-duplication and the limit
    pub requested: usize,
    pub fetched: usize,
    pub already_cached: usize,
    pub failed: usize,
}

/// Background populator for predicted keys
#[derive(Clone)]
pub struct Prefetcher {
    store: BlobStore,
    fetcher: Arc<dyn RemoteFetcher>,
    /// Maximum keys accepted per request
    limit: usize,
}

impl Prefetcher {
    pub fn new(store: BlobStore, fetcher: Arc<dyn RemoteFetcher>, limit: usize) -> Self {
        Self {
            store,
            fetcher,
            limit,
        }
    }

    /// Prefetch `keys` in order, without blocking the caller
    ///
    /// Only the first `limit` distinct keys are considered, and a finished
    /// prefetch never schedules another. The returned handle may be dropped;
    /// the work carries on regardless.
    pub fn prefetch<I>(&self, keys: I) -> JoinHandle<PrefetchReport>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .take(self.limit)
            .collect();

        let store = self.store.clone();
        let fetcher = Arc::clone(&self.fetcher);

        tokio::spawn(async move {
            let mut report = PrefetchReport {
                requested: keys.len(),
                ..PrefetchReport::default()
            };

            for key in keys {
                if store.contains(&key) {
                    report.already_cached += 1;
                    continue;
                }

                let fetcher = Arc::clone(&fetcher);
                let url = key.clone();
                let result = store
                    .store_with(&key, move || async move { fetcher.fetch_blob(&url).await })
                    .await;

                match result {
                    Ok(handle) => {
                        debug!(key = %key, size = handle.size_bytes, "Prefetched blob");
                        report.fetched += 1;
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "Prefetch failed, ignoring");
                        report.failed += 1;
                    }
                }
            }

            debug!(
                requested = report.requested,
                fetched = report.fetched,
                cached = report.already_cached,
                failed = report.failed,
                "Prefetch finished"
            );
            report
        })
    }
}

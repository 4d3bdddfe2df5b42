//! In-process fetcher for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use super::client::RemoteFetcher;
use super::errors::FetchError;
use super::types::{Listing, ListingItem};

/// Serves canned blobs and listings, counting every call
#[derive(Default)]
pub(crate) struct FakeFetcher {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    listings: Mutex<HashMap<(String, u32), Listing>>,
    delay: Option<Duration>,
    blob_calls: AtomicUsize,
    listing_calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn add_blob(&self, url: &str, bytes: &[u8]) {
        self.blobs.lock().unwrap().insert(url.to_string(), bytes.to_vec());
    }

    pub fn add_listing(&self, source_id: &str, page: u32, titles: &[&str]) {
        let items = titles
            .iter()
            .map(|title| ListingItem {
                id: format!("{}-id", title),
                hid: format!("{}-hid", title),
                title: title.to_string(),
                image: format!("https://img.example/{}.jpg", title),
                slug: title.to_lowercase(),
            })
            .collect();
        self.listings
            .lock()
            .unwrap()
            .insert((source_id.to_string(), page), items);
    }

    pub fn blob_calls(&self) -> usize {
        self.blob_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

impl RemoteFetcher for FakeFetcher {
    fn fetch_listing<'a>(
        &'a self,
        source_id: &'a str,
        page: u32,
    ) -> BoxFuture<'a, Result<Listing, FetchError>> {
        async move {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.listings
                .lock()
                .unwrap()
                .get(&(source_id.to_string(), page))
                .cloned()
                .ok_or_else(|| FetchError::Server(503, "listing unavailable".to_string()))
        }
        .boxed()
    }

    fn fetch_blob<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        async move {
            self.blob_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.blobs
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(url.to_string()))
        }
        .boxed()
    }
}

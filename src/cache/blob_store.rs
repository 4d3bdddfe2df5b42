//! Local Blob Store
//!
//! Caches downloaded binary content (images) on local disk, tracked by the
//! persisted blob index. Concurrent stores of the same key share one
//! download and one write. Eviction runs after every store and at startup.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::blob_index::{self, BlobIndex, BlobIndexEntry};
use super::errors::CacheError;
use super::eviction::EvictionPolicy;
use crate::config::CacheConfig;
use crate::remote::FetchError;

/// Suffix of files still being written
const TMP_SUFFIX: &str = ".tmp";

/// Local handle to a cached blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    /// Remote key the blob was stored under
    pub source_key: String,
    /// Path of the content file
    pub path: PathBuf,
    /// Size of the content in bytes
    pub size_bytes: u64,
}

impl BlobHandle {
    /// Read the cached content
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// Statistics about the blob store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlobStoreStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    /// Content files written since startup
    pub writes: u64,
    /// Index file rewrites since startup
    pub index_writes: u64,
    /// Stores currently in flight
    pub pending: usize,
}

type StoreResult = Result<BlobHandle, CacheError>;

/// In-flight store, shared by every caller asking for the same key
type PendingStore = Shared<BoxFuture<'static, StoreResult>>;

struct Pending {
    id: u64,
    future: PendingStore,
}

struct StoreState {
    index: BlobIndex,
    pending: HashMap<String, Pending>,
    /// Bumped by `clear_all`; writes started under an older epoch are discarded
    epoch: u64,
    next_op_id: u64,
}

struct StoreInner {
    blob_dir: PathBuf,
    index_path: PathBuf,
    policy: EvictionPolicy,
    /// Index and pending table; never held across I/O
    state: Mutex<StoreState>,
    /// Serializes index file writes so the newest snapshot always lands last
    persist_lock: tokio::sync::Mutex<()>,
    /// Set by lookups whose touch has not reached disk yet
    touch_dirty: AtomicBool,
    /// A background index writer is running
    touch_writer: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    index_writes: AtomicU64,
}

/// Disk-backed blob cache
///
/// Cheap to clone; clones share the same index and pending table.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<StoreInner>,
}

/// What to do with a finished write once the index has been consulted
enum Commit {
    Recorded {
        replaced: Option<BlobIndexEntry>,
        evicted: Vec<BlobIndexEntry>,
    },
    Discarded,
}

impl BlobStore {
    /// Open the blob store described by `config`
    ///
    /// Creates the cache directories, loads the index (an unreadable index is
    /// replaced by an empty one), drops entries whose file vanished, deletes
    /// leftover temp files and unindexed content, then runs one eviction pass.
    ///
    /// # Arguments
    /// * `config` - Cache root, size budget and maximum age
    ///
    /// # Returns
    /// The store, or `CacheError::Storage` if the blob directory cannot be created
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let blob_dir = config.blob_dir();
        let index_path = config.index_path();

        tokio::fs::create_dir_all(&blob_dir).await.map_err(|e| {
            CacheError::Storage(format!(
                "Failed to create cache directory {}: {}",
                blob_dir.display(),
                e
            ))
        })?;

        let index = {
            let blob_dir = blob_dir.clone();
            let index_path = index_path.clone();
            blocking(move || Ok(recover_index(&blob_dir, &index_path)))
                .await
                .map_err(|e| CacheError::Storage(e.to_string()))?
        };

        let store = Self {
            inner: Arc::new(StoreInner {
                blob_dir,
                index_path,
                policy: EvictionPolicy::new(config.max_cache_size, config.max_cache_age),
                state: Mutex::new(StoreState {
                    index,
                    pending: HashMap::new(),
                    epoch: 0,
                    next_op_id: 0,
                }),
                persist_lock: tokio::sync::Mutex::new(()),
                touch_dirty: AtomicBool::new(false),
                touch_writer: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                index_writes: AtomicU64::new(0),
            }),
        };

        let evicted = store.sweep().await;
        let stats = store.stats();

        info!(
            blob_dir = %store.inner.blob_dir.display(),
            entries = stats.entries,
            total_mb = stats.total_size / (1024 * 1024),
            max_size_mb = config.max_cache_size / (1024 * 1024),
            evicted,
            "Blob store initialized"
        );

        Ok(store)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        // Every critical section leaves the index consistent before it can panic
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the blob directory path
    pub fn blob_dir(&self) -> &Path {
        &self.inner.blob_dir
    }

    fn handle_for(&self, entry: &BlobIndexEntry) -> BlobHandle {
        BlobHandle {
            source_key: entry.source_key.clone(),
            path: self.inner.blob_dir.join(&entry.storage_path),
            size_bytes: entry.size_bytes,
        }
    }

    /// Whether the index has an entry for `source_key` (does not count as an access)
    pub fn contains(&self, source_key: &str) -> bool {
        self.state().index.get(source_key).is_some()
    }

    /// Look up a cached blob
    ///
    /// Hits refresh the entry's access time. An entry whose file has
    /// disappeared is dropped from the index and reported as a miss.
    pub async fn lookup(&self, source_key: &str) -> Option<BlobHandle> {
        let entry = self.state().index.get(source_key).cloned();
        let Some(entry) = entry else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = source_key, "Blob cache MISS");
            return None;
        };

        let handle = self.handle_for(&entry);
        match tokio::fs::metadata(&handle.path).await {
            Ok(_) => {
                let touched = {
                    let mut state = self.state();
                    let current = state
                        .index
                        .get(source_key)
                        .is_some_and(|e| e.storage_path == entry.storage_path);
                    current && state.index.touch(source_key, Utc::now())
                };
                if !touched {
                    // Replaced or removed while we were checking the file
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.schedule_persist();
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = source_key, "Blob cache HIT");
                Some(handle)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    key = source_key,
                    path = %handle.path.display(),
                    "Cached file missing, dropping stale index entry"
                );
                let removed = self
                    .state()
                    .index
                    .remove_if_path(source_key, &entry.storage_path)
                    .is_some();
                if removed {
                    self.schedule_persist();
                }
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = source_key, error = %e, "Failed to inspect cached file");
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `bytes` under `source_key`
    pub async fn store(&self, source_key: &str, bytes: Vec<u8>) -> StoreResult {
        self.store_with(source_key, move || async move { Ok(bytes) })
            .await
    }

    /// Store the bytes produced by `produce` under `source_key`
    ///
    /// If a store for the same key is already in flight, `produce` is never
    /// called and this call resolves to the in-flight result. The work runs in
    /// its own task, so it completes even if every caller stops waiting.
    ///
    /// # Arguments
    /// * `source_key` - Remote key (URL) the content belongs to
    /// * `produce` - Closure that downloads the content if no store is in flight
    ///
    /// # Returns
    /// Handle to the stored file, shared by every coalesced caller
    pub async fn store_with<F, Fut>(&self, source_key: &str, produce: F) -> StoreResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, FetchError>> + Send + 'static,
    {
        let future = {
            let mut state = self.state();
            let in_flight = state.pending.get(source_key).map(|p| p.future.clone());
            match in_flight {
                Some(future) => {
                    debug!(key = source_key, "Joining in-flight store");
                    future
                }
                None => {
                    let op_id = state.next_op_id;
                    state.next_op_id += 1;
                    let epoch = state.epoch;

                    let store = self.clone();
                    let key = source_key.to_string();
                    let task = tokio::spawn(async move {
                        store.run_store(key, op_id, epoch, produce).await
                    });

                    let key = source_key.to_string();
                    let future = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(CacheError::write(&key, format!("store task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();

                    state.pending.insert(
                        source_key.to_string(),
                        Pending {
                            id: op_id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    async fn run_store<F, Fut>(self, key: String, op_id: u64, epoch: u64, produce: F) -> StoreResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let result = self.write_and_record(&key, epoch, produce).await;

        {
            let mut state = self.state();
            if state.pending.get(&key).is_some_and(|p| p.id == op_id) {
                state.pending.remove(&key);
            }
        }

        if let Err(ref e) = result {
            warn!(key = %key, error = %e, "Failed to cache blob");
        }
        result
    }

    async fn write_and_record<F, Fut>(&self, key: &str, epoch: u64, produce: F) -> StoreResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let bytes = produce().await?;
        let size_bytes = bytes.len() as u64;

        let storage_path = {
            let blob_dir = self.inner.blob_dir.clone();
            let prefix = file_prefix(key);
            blocking(move || write_blob_file(&blob_dir, &prefix, &bytes))
                .await
                .map_err(|e| CacheError::write(key, e))?
        };
        self.inner.writes.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        let entry = BlobIndexEntry {
            source_key: key.to_string(),
            storage_path,
            size_bytes,
            last_accessed_at: now,
        };
        let handle = self.handle_for(&entry);

        let commit = {
            let mut state = self.state();
            if state.epoch != epoch {
                Commit::Discarded
            } else {
                let replaced = state.index.insert(entry.clone());
                let evicted = self.evict_locked(&mut state, now);
                Commit::Recorded { replaced, evicted }
            }
        };

        let (replaced, evicted) = match commit {
            Commit::Recorded { replaced, evicted } => (replaced, evicted),
            Commit::Discarded => {
                debug!(key = key, "Cache cleared during write, discarding blob");
                remove_quietly(&handle.path).await;
                return Err(CacheError::write(
                    key,
                    "cache was cleared while the write was in flight",
                ));
            }
        };

        if let Err(e) = self.persist_index().await {
            let rolled_back = self
                .state()
                .index
                .remove_if_path(key, &entry.storage_path)
                .is_some();
            if rolled_back {
                remove_quietly(&handle.path).await;
            }
            self.delete_files(evicted).await;
            return Err(CacheError::write(key, format!("failed to persist index: {}", e)));
        }

        let evicted_self = evicted.iter().any(|e| e.storage_path == entry.storage_path);
        let mut stale: Vec<BlobIndexEntry> = replaced.into_iter().collect();
        stale.extend(evicted);
        self.delete_files(stale).await;

        if evicted_self {
            return Err(CacheError::write(key, "evicted immediately by the size budget"));
        }

        debug!(
            key = key,
            path = %handle.path.display(),
            size = size_bytes,
            "Stored blob in cache"
        );
        Ok(handle)
    }

    /// Apply the eviction policy to the index, returning the removed entries
    fn evict_locked(&self, state: &mut StoreState, now: DateTime<Utc>) -> Vec<BlobIndexEntry> {
        let plan = self.inner.policy.plan(state.index.entries(), now);
        if plan.is_empty() {
            return Vec::new();
        }

        for eviction in &plan {
            debug!(key = %eviction.source_key, reason = ?eviction.reason, "Evicting blob");
        }
        let keys: HashSet<&str> = plan.iter().map(|e| e.source_key.as_str()).collect();
        state.index.remove_all(&keys)
    }

    /// Run one eviction pass now
    ///
    /// Returns the number of entries evicted.
    pub async fn sweep(&self) -> usize {
        let evicted = {
            let mut state = self.state();
            self.evict_locked(&mut state, Utc::now())
        };
        let count = evicted.len();

        if let Err(e) = self.persist_index().await {
            warn!(error = %e, "Failed to persist blob index after sweep");
        }
        if count > 0 {
            info!(evicted = count, "Eviction pass removed blobs");
        }
        self.delete_files(evicted).await;
        count
    }

    /// Remove a cached blob
    ///
    /// Removing a key that is not cached, or whose file is already gone, succeeds.
    pub async fn remove(&self, source_key: &str) -> Result<(), CacheError> {
        let entry = self.state().index.get(source_key).cloned();
        let Some(entry) = entry else {
            debug!(key = source_key, "Remove: key not cached");
            return Ok(());
        };

        let path = self.inner.blob_dir.join(&entry.storage_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::Storage(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        self.state()
            .index
            .remove_if_path(source_key, &entry.storage_path);
        self.persist_index()
            .await
            .map_err(|e| CacheError::Storage(format!("Failed to persist index: {}", e)))?;

        debug!(key = source_key, "Removed cached blob");
        Ok(())
    }

    /// Delete every cached blob and reset the index
    ///
    /// Does not wait for in-flight stores; when they finish, their results are
    /// discarded instead of re-entering the index. Only files of the dropped
    /// entries are deleted: content names are never reused, so a store that
    /// commits after the reset keeps its file. Individual delete failures are
    /// logged and skipped. Returns the number of files deleted.
    pub async fn clear_all(&self) -> usize {
        let dropped = {
            let mut state = self.state();
            state.epoch += 1;
            state.pending.clear();
            state.index.clear()
        };
        let entries = dropped.len();

        if let Err(e) = self.persist_index().await {
            warn!(error = %e, "Failed to persist cleared blob index");
        }
        let deleted = self.delete_files(dropped).await;

        info!(entries, files = deleted, "Cleared blob cache");
        deleted
    }

    /// Get current store statistics
    pub fn stats(&self) -> BlobStoreStats {
        let state = self.state();
        BlobStoreStats {
            entries: state.index.len(),
            total_size: state.index.total_size(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            index_writes: self.inner.index_writes.load(Ordering::Relaxed),
            pending: state.pending.len(),
        }
    }

    /// Snapshot of the index entries in insertion order
    pub fn entries(&self) -> Vec<BlobIndexEntry> {
        self.state().index.entries().to_vec()
    }

    /// Total size of indexed blobs
    pub fn total_size(&self) -> u64 {
        self.state().index.total_size()
    }

    /// Write the current index to disk
    async fn persist_index(&self) -> io::Result<()> {
        let _writer = self.inner.persist_lock.lock().await;
        // Snapshot under the writer guard so a newer state is never overwritten by an older one
        self.inner.touch_dirty.store(false, Ordering::SeqCst);
        let snapshot = self.state().index.entries().to_vec();
        let path = self.inner.index_path.clone();
        blocking(move || blob_index::save(&path, &snapshot)).await?;
        self.inner.index_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persist the index in the background
    ///
    /// At most one background writer runs at a time. Touches that arrive
    /// while it is writing are folded into its next pass.
    fn schedule_persist(&self) {
        let inner = &self.inner;
        inner.touch_dirty.store(true, Ordering::SeqCst);
        if inner.touch_writer.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            let inner = &store.inner;
            loop {
                if let Err(e) = store.persist_index().await {
                    warn!(error = %e, "Failed to persist blob index");
                }
                inner.touch_writer.store(false, Ordering::SeqCst);

                // Another pass only if something changed and no new writer took over
                if !inner.touch_dirty.load(Ordering::SeqCst)
                    || inner.touch_writer.swap(true, Ordering::SeqCst)
                {
                    break;
                }
            }
        });
    }

    /// Delete the content files of `entries`, returning how many were removed
    async fn delete_files(&self, entries: Vec<BlobIndexEntry>) -> usize {
        let mut deleted = 0;
        for entry in entries {
            let path = self.inner.blob_dir.join(&entry.storage_path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(key = %entry.source_key, size = entry.size_bytes, "Deleted cached file");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete cached file"),
            }
        }
        deleted
    }
}

/// Run blocking filesystem work off the async workers
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete discarded file");
        }
    }
}

/// Readable, key-derived prefix for content file names
fn file_prefix(source_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source_key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Write `bytes` to a fresh, uniquely named file in `blob_dir`
///
/// The content is written to a temp file and renamed into place, so a
/// crash never leaves a partial file under a final name.
fn write_blob_file(blob_dir: &Path, prefix: &str, bytes: &[u8]) -> io::Result<String> {
    fs::create_dir_all(blob_dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{}-", prefix))
        .suffix(TMP_SUFFIX)
        .tempfile_in(blob_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    let name = tmp
        .path()
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(TMP_SUFFIX))
        .map(str::to_string)
        .ok_or_else(|| io::Error::other("temp file name is not valid UTF-8"))?;

    tmp.persist_noclobber(blob_dir.join(&name))
        .map_err(|e| e.error)?;
    Ok(name)
}

/// Load the index and reconcile it with the blob directory
fn recover_index(blob_dir: &Path, index_path: &Path) -> BlobIndex {
    let mut index = match blob_index::load(index_path) {
        Ok(index) => index,
        Err(e) => {
            warn!(path = %index_path.display(), error = %e, "Blob index unreadable, starting empty");
            BlobIndex::new()
        }
    };

    let missing: Vec<String> = index
        .entries()
        .iter()
        .filter(|e| !blob_dir.join(&e.storage_path).is_file())
        .map(|e| e.source_key.clone())
        .collect();
    if !missing.is_empty() {
        warn!(count = missing.len(), "Dropping index entries with missing files");
        let keys: HashSet<&str> = missing.iter().map(String::as_str).collect();
        index.remove_all(&keys);
    }

    // Remove temp files from interrupted writes and content the index does not know
    let known: HashSet<String> = index.storage_paths().into_iter().map(str::to_string).collect();
    if let Ok(read_dir) = fs::read_dir(blob_dir) {
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains(&name) {
                continue;
            }
            debug!(path = %path.display(), "Removing orphaned cache file");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove orphaned cache file");
            }
        }
    }

    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    async fn open_store(root: &Path, max_size: u64) -> BlobStore {
        let config = CacheConfig::new(root).with_max_cache_size(max_size);
        BlobStore::open(&config).await.unwrap()
    }

    fn count_files(dir: &Path) -> usize {
        fs::read_dir(dir).map(|rd| rd.flatten().count()).unwrap_or(0)
    }

    /// Wait for the background index writer to finish
    async fn settle(store: &BlobStore) {
        for _ in 0..400 {
            if !store.inner.touch_writer.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background index writer never finished");
    }

    #[tokio::test]
    async fn test_store_then_lookup_returns_same_bytes() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024 * 1024).await;
        let data = b"\x89PNG\r\n\x1a\nnot really a png".to_vec();

        let stored = store.store("https://img/a.png", data.clone()).await.unwrap();
        assert_eq!(stored.size_bytes, data.len() as u64);

        let found = store.lookup("https://img/a.png").await.unwrap();
        assert_eq!(found, stored);
        assert_eq!(found.read().await.unwrap(), data);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;

        assert!(store.lookup("https://img/none.png").await.is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_lookup_self_heals_missing_file() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;

        let handle = store.store("k", b"abc".to_vec()).await.unwrap();
        fs::remove_file(&handle.path).unwrap();

        assert!(store.lookup("k").await.is_none());
        assert!(!store.contains("k"));
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;
        store.store("keep", b"1".to_vec()).await.unwrap();
        let gone = store.store("gone", b"22".to_vec()).await.unwrap();

        store.remove("gone").await.unwrap();
        let after_first = store.entries();
        store.remove("gone").await.unwrap();

        assert_eq!(store.entries(), after_first);
        assert!(!gone.path.exists());
        assert!(store.contains("keep"));
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;
        let handle = store.store("k", b"abc".to_vec()).await.unwrap();
        fs::remove_file(&handle.path).unwrap();

        store.remove("k").await.unwrap();
        assert!(!store.contains("k"));
    }

    #[tokio::test]
    async fn test_size_budget_evicts_earlier_of_equal_entries() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1000).await;

        let x = store.store("X", vec![0u8; 600]).await.unwrap();
        let y = store.store("Y", vec![1u8; 600]).await.unwrap();

        let keys: Vec<String> = store.entries().into_iter().map(|e| e.source_key).collect();
        assert_eq!(keys, vec!["Y".to_string()]);
        assert_eq!(store.total_size(), 600);
        assert!(!x.path.exists());
        assert!(y.path.exists());
    }

    #[tokio::test]
    async fn test_total_size_within_budget_after_every_store() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1000).await;

        for i in 0..20u64 {
            let size = (i * 37 % 300 + 50) as usize;
            store.store(&format!("k{}", i), vec![7u8; size]).await.unwrap();
            assert!(store.total_size() <= 1000);
        }
        assert_eq!(count_files(store.blob_dir()), store.stats().entries);
    }

    #[tokio::test]
    async fn test_oversized_single_entry_is_kept() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 100).await;
        store.store("small", vec![0u8; 10]).await.unwrap();

        let big = store.store("big", vec![0u8; 500]).await.unwrap();

        assert!(big.path.exists());
        let keys: Vec<String> = store.entries().into_iter().map(|e| e.source_key).collect();
        assert_eq!(keys, vec!["big".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_replaces_previous_file() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;

        let first = store.store("k", b"v1".to_vec()).await.unwrap();
        let second = store.store("k", b"version2".to_vec()).await.unwrap();

        assert_ne!(first.path, second.path);
        assert!(!first.path.exists());
        assert_eq!(store.stats().entries, 1);
        assert_eq!(store.total_size(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_stores_coalesce() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024 * 1024).await;
        let downloads = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let downloads = Arc::clone(&downloads);
                tokio::spawn(async move {
                    store
                        .store_with("https://img/shared.png", move || async move {
                            downloads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(b"shared bytes".to_vec())
                        })
                        .await
                })
            })
            .collect();

        let mut handles = Vec::new();
        for caller in callers {
            handles.push(caller.await.unwrap().unwrap());
        }

        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().writes, 1);
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;

        let err = store
            .store_with("k", || async { Err(FetchError::NotFound("gone".to_string())) })
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Network(FetchError::NotFound(_))));
        assert_eq!(store.stats().entries, 0);
        assert_eq!(store.stats().pending, 0);
        assert_eq!(count_files(store.blob_dir()), 0);

        // The failed operation no longer blocks a new one
        store.store("k", b"ok".to_vec()).await.unwrap();
        assert!(store.contains("k"));
    }

    #[tokio::test]
    async fn test_clear_during_store_does_not_resurrect() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;
        store.store("old", b"old".to_vec()).await.unwrap();

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .store_with("slow", move || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(b"late".to_vec())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        store.clear_all().await;
        release_tx.send(()).unwrap();

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(CacheError::Write { .. })));
        assert!(store.lookup("slow").await.is_none());
        assert!(store.lookup("old").await.is_none());
        assert_eq!(store.stats().entries, 0);
        assert_eq!(count_files(store.blob_dir()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stores_racing_clear_keep_their_files() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 64 * 1024 * 1024).await;

        for round in 0..3 {
            for i in 0..200 {
                store
                    .store(&format!("old-{}-{}", round, i), vec![1u8; 64])
                    .await
                    .unwrap();
            }

            let clearing = {
                let store = store.clone();
                tokio::spawn(async move { store.clear_all().await })
            };
            let writers: Vec<_> = (0..50)
                .map(|i| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        store.store(&format!("new-{}-{}", round, i), vec![2u8; 64]).await
                    })
                })
                .collect();

            clearing.await.unwrap();
            for writer in writers {
                // Writes overlapping the clear may be discarded; that is fine
                let _ = writer.await.unwrap();
            }

            let entries = store.entries();
            for entry in &entries {
                assert!(
                    store.blob_dir().join(&entry.storage_path).is_file(),
                    "round {}: {} points at a deleted file",
                    round,
                    entry.source_key
                );
            }
            assert_eq!(count_files(store.blob_dir()), entries.len());
        }
    }

    #[tokio::test]
    async fn test_lookup_refresh_protects_entry_from_size_eviction() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1000).await;

        let a = store.store("A", vec![0u8; 400]).await.unwrap();
        let b = store.store("B", vec![1u8; 400]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.lookup("A").await, Some(a.clone()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let c = store.store("C", vec![2u8; 400]).await.unwrap();

        let keys: Vec<String> = store.entries().into_iter().map(|e| e.source_key).collect();
        assert_eq!(keys, vec!["A".to_string(), "C".to_string()]);
        assert!(a.path.exists());
        assert!(!b.path.exists());
        assert!(c.path.exists());
    }

    #[tokio::test]
    async fn test_lookup_touch_is_persisted() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        let touched_at = {
            let store = BlobStore::open(&config).await.unwrap();
            store.store("A", b"alpha".to_vec()).await.unwrap();
            let stored_at = store.entries()[0].last_accessed_at;

            tokio::time::sleep(Duration::from_millis(5)).await;
            store.lookup("A").await.unwrap();
            let touched_at = store.entries()[0].last_accessed_at;
            assert!(touched_at > stored_at);

            settle(&store).await;
            touched_at
        };

        let on_disk = blob_index::load(&config.index_path()).unwrap();
        assert_eq!(on_disk.get("A").map(|e| e.last_accessed_at), Some(touched_at));

        let reopened = BlobStore::open(&config).await.unwrap();
        assert_eq!(reopened.entries()[0].last_accessed_at, touched_at);
    }

    #[tokio::test]
    async fn test_lookup_burst_shares_one_index_write() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        let store = BlobStore::open(&config).await.unwrap();
        store.store("A", b"alpha".to_vec()).await.unwrap();
        let before = store.stats().index_writes;

        {
            // Hold the writer guard so every touch lands while a write is pending
            let _busy = store.inner.persist_lock.lock().await;
            for _ in 0..50 {
                store.lookup("A").await.unwrap();
            }
        }
        settle(&store).await;

        assert_eq!(store.stats().index_writes - before, 1);
        let last_touch = store.entries()[0].last_accessed_at;
        let on_disk = blob_index::load(&config.index_path()).unwrap();
        assert_eq!(on_disk.get("A").map(|e| e.last_accessed_at), Some(last_touch));
    }

    #[tokio::test]
    async fn test_clear_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024).await;
        store.store("a", b"a".to_vec()).await.unwrap();
        store.store("b", b"b".to_vec()).await.unwrap();

        assert_eq!(store.clear_all().await, 2);
        assert_eq!(store.clear_all().await, 0);
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let a = {
            let store = open_store(dir.path(), 1024).await;
            let a = store.store("a", b"alpha".to_vec()).await.unwrap();
            store.store("b", b"beta".to_vec()).await.unwrap();
            a
        };

        let store = open_store(dir.path(), 1024).await;
        let keys: Vec<String> = store.entries().into_iter().map(|e| e.source_key).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.lookup("a").await, Some(a));
        assert_eq!(store.lookup("b").await.unwrap().read().await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn test_corrupt_index_recovers_empty() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        fs::create_dir_all(config.blob_dir()).unwrap();
        fs::write(config.index_path(), b"\x00\x01 garbage").unwrap();
        fs::write(config.blob_dir().join("orphan-file"), b"x").unwrap();

        let store = BlobStore::open(&config).await.unwrap();

        assert_eq!(store.stats().entries, 0);
        assert_eq!(count_files(store.blob_dir()), 0);
        store.store("k", b"v".to_vec()).await.unwrap();
        assert!(store.lookup("k").await.is_some());
    }

    #[tokio::test]
    async fn test_startup_sweep_drops_expired_entries() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        fs::create_dir_all(config.blob_dir()).unwrap();
        fs::write(config.blob_dir().join("old-blob"), b"old").unwrap();
        fs::write(config.blob_dir().join("new-blob"), b"new").unwrap();

        let now = Utc::now();
        let entries = vec![
            BlobIndexEntry {
                source_key: "old".to_string(),
                storage_path: "old-blob".to_string(),
                size_bytes: 3,
                last_accessed_at: now - chrono::Duration::days(8),
            },
            BlobIndexEntry {
                source_key: "new".to_string(),
                storage_path: "new-blob".to_string(),
                size_bytes: 3,
                last_accessed_at: now - chrono::Duration::hours(1),
            },
        ];
        blob_index::save(&config.index_path(), &entries).unwrap();

        let store = BlobStore::open(&config).await.unwrap();

        assert!(!store.contains("old"));
        assert!(store.contains("new"));
        assert!(!config.blob_dir().join("old-blob").exists());
    }

    #[tokio::test]
    async fn test_startup_removes_temp_files_and_dangling_entries() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        fs::create_dir_all(config.blob_dir()).unwrap();
        fs::write(config.blob_dir().join("abc-123.tmp"), b"partial").unwrap();

        let entries = vec![BlobIndexEntry {
            source_key: "vanished".to_string(),
            storage_path: "vanished-blob".to_string(),
            size_bytes: 10,
            last_accessed_at: Utc::now(),
        }];
        blob_index::save(&config.index_path(), &entries).unwrap();

        let store = BlobStore::open(&config).await.unwrap();

        assert_eq!(store.stats().entries, 0);
        assert_eq!(count_files(store.blob_dir()), 0);
    }

    #[tokio::test]
    async fn test_tampered_index_cannot_reach_outside_blob_dir() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        fs::create_dir_all(config.blob_dir()).unwrap();
        let outside = dir.path().join("keep-me");
        fs::write(&outside, b"not cache content").unwrap();

        let entries = vec![BlobIndexEntry {
            source_key: "escape".to_string(),
            storage_path: "../keep-me".to_string(),
            size_bytes: 17,
            last_accessed_at: Utc::now(),
        }];
        blob_index::save(&config.index_path(), &entries).unwrap();

        let store = BlobStore::open(&config).await.unwrap();
        assert!(!store.contains("escape"));
        store.remove("escape").await.unwrap();
        store.clear_all().await;

        assert_eq!(fs::read(&outside).unwrap(), b"not cache content");
    }

    #[test]
    fn test_file_prefix_is_stable_hex() {
        let a = file_prefix("https://img/a.png");
        assert_eq!(a, file_prefix("https://img/a.png"));
        assert_ne!(a, file_prefix("https://img/b.png"));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_write_blob_file_names_are_unique() {
        let dir = tempdir().unwrap();
        let first = write_blob_file(dir.path(), "p", b"1").unwrap();
        let second = write_blob_file(dir.path(), "p", b"1").unwrap();

        assert_ne!(first, second);
        assert!(!first.ends_with(TMP_SUFFIX));
        assert_eq!(fs::read(dir.path().join(&first)).unwrap(), b"1");
    }
}

//! Blob Index
//!
//! Ordered record of every cached blob, persisted whole as JSON after each
//! mutation. Order is insertion order and doubles as the eviction tie-break.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// On-disk format version
const INDEX_VERSION: u32 = 1;

/// Metadata for one cached blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobIndexEntry {
    /// Remote key (URL) the blob was downloaded from
    pub source_key: String,
    /// File name relative to the blob directory
    pub storage_path: String,
    /// Size of the stored file in bytes
    pub size_bytes: u64,
    /// Last time the blob was stored or looked up
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<BlobIndexEntry>,
}

/// Errors while loading the index; recovered by starting empty
#[derive(Debug, thiserror::Error)]
pub enum IndexLoadError {
    #[error("Failed to read index: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index is corrupt: {0}")]
    Corrupt(String),
}

/// Ordered collection of blob entries, at most one per source key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobIndex {
    entries: Vec<BlobIndexEntry>,
}

impl BlobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from entries in insertion order
    ///
    /// Duplicate keys collapse to the last occurrence.
    pub fn from_entries(entries: Vec<BlobIndexEntry>) -> Self {
        let mut index = Self::new();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    pub fn entries(&self) -> &[BlobIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, source_key: &str) -> Option<&BlobIndexEntry> {
        self.entries.iter().find(|e| e.source_key == source_key)
    }

    /// Sum of all entry sizes
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Insert an entry at the end, replacing any entry for the same key
    pub fn insert(&mut self, entry: BlobIndexEntry) -> Option<BlobIndexEntry> {
        let replaced = self.remove(&entry.source_key);
        self.entries.push(entry);
        replaced
    }

    /// Update the access time of an entry in place
    pub fn touch(&mut self, source_key: &str, now: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.source_key == source_key) {
            Some(entry) => {
                entry.last_accessed_at = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, source_key: &str) -> Option<BlobIndexEntry> {
        let pos = self.entries.iter().position(|e| e.source_key == source_key)?;
        Some(self.entries.remove(pos))
    }

    /// Remove an entry only if it still points at `storage_path`
    ///
    /// Guards against dropping a newer entry that replaced the one a caller inspected.
    pub fn remove_if_path(&mut self, source_key: &str, storage_path: &str) -> Option<BlobIndexEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.source_key == source_key && e.storage_path == storage_path)?;
        Some(self.entries.remove(pos))
    }

    /// Remove every entry whose key is in `keys`, returning them in index order
    pub fn remove_all(&mut self, keys: &HashSet<&str>) -> Vec<BlobIndexEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| keys.contains(e.source_key.as_str()));
        self.entries = kept;
        removed
    }

    /// Empty the index, returning what it held
    pub fn clear(&mut self) -> Vec<BlobIndexEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Storage paths referenced by the index
    pub fn storage_paths(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.storage_path.as_str()).collect()
    }
}

/// Load the index file
///
/// A missing file is an empty index, not an error.
pub fn load(path: &Path) -> Result<BlobIndex, IndexLoadError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BlobIndex::new()),
        Err(e) => return Err(e.into()),
    };

    let file: IndexFile =
        serde_json::from_slice(&data).map_err(|e| IndexLoadError::Corrupt(e.to_string()))?;

    if file.version != INDEX_VERSION {
        return Err(IndexLoadError::Corrupt(format!(
            "unsupported index version {}",
            file.version
        )));
    }

    let total = file.entries.len();
    let entries: Vec<BlobIndexEntry> = file
        .entries
        .into_iter()
        .filter(|e| {
            let valid = is_plain_file_name(&e.storage_path);
            if !valid {
                warn!(key = %e.source_key, storage_path = %e.storage_path, "Ignoring index entry outside the blob directory");
            }
            valid
        })
        .collect();

    debug!(path = %path.display(), entries = entries.len(), skipped = total - entries.len(), "Loaded blob index");
    Ok(BlobIndex::from_entries(entries))
}

/// Whether `storage_path` names a file directly inside the blob directory
fn is_plain_file_name(storage_path: &str) -> bool {
    let mut components = Path::new(storage_path).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Write the index atomically (temp file + rename)
pub fn save(path: &Path, entries: &[BlobIndexEntry]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let file = IndexFile {
        version: INDEX_VERSION,
        entries: entries.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&file)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".index-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), entries = entries.len(), "Persisted blob index");
    Ok(())
}

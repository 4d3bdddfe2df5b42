//! Cache Error Types
//!
//! Errors are `Clone` so a single in-flight store can hand the same
//! result to every coalesced caller.

use crate::remote::FetchError;

/// Errors surfaced by the blob store and cache manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The remote fetch collaborator failed; never retried here
    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    /// Deleting or inspecting backing storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Writing a blob could not complete; nothing was recorded
    #[error("Cache write failed for {key}: {reason}")]
    Write { key: String, reason: String },
}

impl CacheError {
    pub(crate) fn write(key: &str, reason: impl std::fmt::Display) -> Self {
        CacheError::Write {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

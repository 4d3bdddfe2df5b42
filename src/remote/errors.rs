//! Remote Fetch Error Types
//!
//! Structured errors for listing and image downloads.
//! The cache surfaces these unchanged; retry policy belongs to the caller.

/// Remote fetch error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited by remote")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Create a FetchError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            403 => FetchError::Forbidden(body.to_string()),
            404 => FetchError::NotFound(body.to_string()),
            408 => FetchError::Timeout,
            429 => FetchError::RateLimited,
            500..=599 => FetchError::Server(status, body.to_string()),
            _ => FetchError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if err.is_connect() {
            FetchError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16(), &err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

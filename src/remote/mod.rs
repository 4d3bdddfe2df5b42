//! Remote content API client
//!
//! The cache never talks to the network directly; it goes through the
//! `RemoteFetcher` trait so callers (and tests) can swap the transport.

pub mod client;
pub mod errors;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{HttpFetcher, RemoteFetcher};
pub use errors::FetchError;
pub use types::*;

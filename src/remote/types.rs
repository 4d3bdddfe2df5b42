//! Listing types and cache keys
//!
//! Defines the structured payload returned by listing endpoints and the
//! composite key the metadata cache stores it under.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Deserialize an identifier that might be encoded as a string, a number or null.
/// Some sources return numeric ids, others return opaque strings.
fn deserialize_flexible_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleStringVisitor;

    impl<'de> de::Visitor<'de> for FlexibleStringVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string, a number, or null")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_none<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }

        fn visit_unit<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }
    }

    deserializer.deserialize_any(FlexibleStringVisitor)
}

/// One item of a listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    /// Source-specific id (falls back to `hid` when absent)
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub id: String,
    /// Stable handle used for follow-up requests
    #[serde(deserialize_with = "deserialize_flexible_string")]
    pub hid: String,
    #[serde(default)]
    pub title: String,
    /// Cover image URL, usable as a blob cache key
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub slug: String,
}

impl ListingItem {
    /// Fill in fields that sources leave out
    pub fn normalize(mut self) -> Self {
        if self.id.is_empty() {
            self.id = self.hid.clone();
        }
        self
    }
}

/// A listing page as cached in memory
pub type Listing = Vec<ListingItem>;

/// Metadata cache key: which source, which page
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub source_id: String,
    pub page: u32,
}

impl ListingKey {
    pub fn new(source_id: impl Into<String>, page: u32) -> Self {
        Self {
            source_id: source_id.into(),
            page,
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.page)
    }
}

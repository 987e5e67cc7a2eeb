//! Source adapters and the aggregator that merges their output.

pub mod aggregator;
pub mod generic_api;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use aggregator::{dedup_key, FetchPolicy, SourceAggregator};
pub use generic_api::{api_key_headers, GenericApiSource, Pagination};

/// A raw record tagged with the source it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWrapper {
    /// Schema-less payload as returned by the source.
    pub raw: Value,
    /// Origin label (URL, folder id, ...).
    pub source: String,
}

impl SourceWrapper {
    /// Wraps `raw` with an origin label.
    pub fn new(raw: Value, source: impl Into<String>) -> Self {
        Self {
            raw,
            source: source.into(),
        }
    }

    /// Wraps an item unless it already is a `{"raw": ..., "source": ...}`
    /// wrapper, in which case the wrapper is unpacked. A wrapper without a
    /// `source` string inherits `fallback_source`.
    pub fn from_item(item: Value, fallback_source: &str) -> Self {
        match item {
            Value::Object(mut map) if map.contains_key("raw") => {
                let raw = map.remove("raw").unwrap_or(Value::Null);
                let source = match map.remove("source") {
                    Some(Value::String(source)) => source,
                    _ => fallback_source.to_string(),
                };
                Self { raw, source }
            }
            other => Self::new(other, fallback_source),
        }
    }
}

/// Anything that can produce a list of wrapped records.
///
/// Errors are tolerated by [`SourceAggregator`]: a failing adapter is retried
/// and then treated as having no data for the cycle.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Label used in logs and as the default origin of records.
    fn label(&self) -> &str;

    /// Fetches every record currently available from the source.
    async fn fetch(&self) -> Result<Vec<SourceWrapper>>;
}

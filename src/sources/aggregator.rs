//! Concurrent fan-out over every configured source, with per-source retries,
//! a shared rate limit and first-seen-wins deduplication.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::document::{canonical_json, is_present, scalar_text};
use crate::error::IngestError;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::sources::{SourceAdapter, SourceWrapper};

/// Retry envelope applied to each adapter independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Attempts per adapter and cycle.
    pub max_attempts: usize,
    /// Deadline for a single `fetch` call.
    pub attempt_timeout: Duration,
    /// Linear backoff unit; the sleep after attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(20),
            backoff_step: Duration::from_millis(500),
        }
    }
}

/// Runs all adapters and merges their records.
pub struct SourceAggregator {
    sources: Vec<Arc<dyn SourceAdapter>>,
    limiter: RateLimiter,
    policy: FetchPolicy,
    dedup_fields: Vec<String>,
    metrics: Arc<Metrics>,
}

impl SourceAggregator {
    /// Builds an aggregator over `sources`.
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        limiter: RateLimiter,
        policy: FetchPolicy,
        dedup_fields: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sources,
            limiter,
            policy: FetchPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            dedup_fields,
            metrics,
        }
    }

    /// Number of configured adapters.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Fetches every source concurrently and returns the deduplicated union,
    /// in source order then record order.
    pub async fn fetch_all(&self) -> Vec<SourceWrapper> {
        let results = join_all(
            self.sources
                .iter()
                .map(|source| self.fetch_with_retry(source.as_ref())),
        )
        .await;

        let mut merged = Vec::new();
        for (source, items) in self.sources.iter().zip(results) {
            merged.extend(items.into_iter().map(|mut wrapper| {
                if wrapper.source.is_empty() {
                    wrapper.source = source.label().to_string();
                }
                wrapper
            }));
        }

        let fetched = merged.len();
        let deduped = dedup_wrappers(merged, &self.dedup_fields);
        let dropped = fetched - deduped.len();
        self.metrics.record_duplicates(dropped);
        info!(
            event = "sources_merged",
            sources = self.sources.len(),
            fetched,
            deduped = deduped.len(),
            "merged source records"
        );
        deduped
    }

    async fn fetch_with_retry(&self, source: &dyn SourceAdapter) -> Vec<SourceWrapper> {
        let attempts = self.policy.max_attempts;
        for attempt in 1..=attempts {
            self.limiter.acquire().await;
            let message = match timeout(self.policy.attempt_timeout, source.fetch()).await {
                Ok(Ok(items)) => return items,
                Ok(Err(err)) => format!("{err:#}"),
                Err(_) => format!("timed out after {:?}", self.policy.attempt_timeout),
            };
            let err = IngestError::Source {
                source_label: source.label().to_string(),
                message,
            };
            warn!(kind = err.kind(), attempt, error = %err, "source fetch attempt failed");
            if attempt < attempts {
                sleep(self.policy.backoff_step * attempt as u32).await;
            }
        }
        warn!(
            source = source.label(),
            attempts, "giving up on source for this cycle"
        );
        Vec::new()
    }
}

/// Key used to collapse duplicates: the first present value among
/// `fields` on the top-level record, else the canonical payload.
pub fn dedup_key(raw: &Value, fields: &[String]) -> String {
    fields
        .iter()
        .filter_map(|field| raw.get(field.as_str()))
        .find(|value| is_present(value))
        .map(scalar_text)
        .unwrap_or_else(|| canonical_json(raw))
}

fn dedup_wrappers(wrappers: Vec<SourceWrapper>, fields: &[String]) -> Vec<SourceWrapper> {
    let mut seen = HashSet::with_capacity(wrappers.len());
    wrappers
        .into_iter()
        .filter(|wrapper| seen.insert(dedup_key(&wrapper.raw, fields)))
        .collect()
}

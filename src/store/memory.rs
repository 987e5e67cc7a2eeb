//! In-process record store with the same contract as the Postgres store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IngestError;
use crate::fingerprint::CandidateRecord;
use crate::store::{ensure_aligned, RecordStore};

/// Persisted representation of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Hash of the payload that produced this row.
    pub content_hash: String,
    /// Stored JSON payload.
    pub payload: Value,
    /// Text the embedding was computed from.
    pub unified_text: String,
    /// Stored embedding.
    pub embedding: Vec<f32>,
    /// Milliseconds since epoch of the last write.
    pub updated_at_epoch_ms: u64,
}

/// `HashMap`-backed store, mainly for tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, StoredRow>>,
    lookups: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row as if it had been upserted earlier.
    pub fn insert_row(&self, stable_id: impl Into<String>, row: StoredRow) {
        self.lock().insert(stable_id.into(), row);
    }

    /// Copy of the row stored under `stable_id`.
    pub fn row(&self, stable_id: &str) -> Option<StoredRow> {
        self.lock().get(stable_id).cloned()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `fetch_hashes` round-trips served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of committed upsert transactions.
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredRow>> {
        // A poisoned map is still structurally valid; every write is a single insert.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_hashes(&self, ids: &[String]) -> Result<HashMap<String, String>, IngestError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let rows = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(id)
                    .map(|row| (id.clone(), row.content_hash.clone()))
            })
            .collect())
    }

    async fn upsert(
        &self,
        batch: &[CandidateRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<(), IngestError> {
        ensure_aligned(batch, embeddings)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut rows = self.lock();
        for (record, embedding) in batch.iter().zip(embeddings) {
            rows.insert(
                record.stable_id.clone(),
                StoredRow {
                    content_hash: record.content_hash.clone(),
                    payload: record.payload.clone(),
                    unified_text: record.unified_text.clone(),
                    embedding: embedding.clone(),
                    updated_at_epoch_ms: now,
                },
            );
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(id: &str, hash: &str) -> CandidateRecord {
        CandidateRecord {
            stable_id: id.to_string(),
            content_hash: hash.to_string(),
            unified_text: format!("text {id}"),
            payload: json!({"id": id}),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repeated_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![candidate("a", "h1"), candidate("b", "h2")];
        let embeddings = vec![vec![0.1, 0.2], vec![0.3, 0.4]];

        store.upsert(&batch, &embeddings).await.expect("first");
        let first_a = store.row("a").expect("row a");
        store.upsert(&batch, &embeddings).await.expect("second");
        let second_a = store.row("a").expect("row a");

        assert_eq!(store.len(), 2);
        assert_eq!(first_a.content_hash, second_a.content_hash);
        assert_eq!(first_a.payload, second_a.payload);
        assert_eq!(first_a.embedding, second_a.embedding);
        assert_eq!(first_a.unified_text, second_a.unified_text);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn misaligned_batch_writes_nothing() {
        let store = MemoryStore::new();
        let err = store
            .upsert(&[candidate("a", "h1")], &[])
            .await
            .expect_err("misaligned");
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(store.is_empty());
        assert_eq!(store.upserts(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lookup_returns_only_known_ids() {
        let store = MemoryStore::new();
        store
            .upsert(&[candidate("a", "h1")], &[vec![1.0]])
            .await
            .unwrap();
        let hashes = store
            .fetch_hashes(&["a".to_string(), "z".to_string()])
            .await
            .unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes.get("a").map(String::as_str), Some("h1"));
        assert_eq!(store.lookups(), 1);
    }
}

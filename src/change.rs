//! Hash-based change detection against the persisted store.

use std::sync::Arc;

use crate::error::IngestError;
use crate::fingerprint::CandidateRecord;
use crate::store::RecordStore;

/// Outcome of comparing one chunk with the stored hashes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// New or changed records, in input order.
    pub to_process: Vec<CandidateRecord>,
    /// Records whose stored hash matched.
    pub skipped: usize,
}

/// Splits candidates into "unchanged" and "needs processing".
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn RecordStore>,
}

impl ChangeDetector {
    /// Detector reading hashes from `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Looks up every id of `chunk` in one query and keeps the records that
    /// have no stored row or a different stored hash.
    pub async fn partition(&self, chunk: Vec<CandidateRecord>) -> Result<ChangeSet, IngestError> {
        if chunk.is_empty() {
            return Ok(ChangeSet::default());
        }
        let ids: Vec<String> = chunk.iter().map(|record| record.stable_id.clone()).collect();
        let stored = self.store.fetch_hashes(&ids).await?;

        let total = chunk.len();
        let to_process: Vec<CandidateRecord> = chunk
            .into_iter()
            .filter(|record| stored.get(&record.stable_id) != Some(&record.content_hash))
            .collect();
        Ok(ChangeSet {
            skipped: total - to_process.len(),
            to_process,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredRow};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn candidate(id: &str, hash: &str) -> CandidateRecord {
        CandidateRecord {
            stable_id: id.to_string(),
            content_hash: hash.to_string(),
            unified_text: id.to_string(),
            payload: json!({"email": id}),
        }
    }

    fn stored(hash: &str) -> StoredRow {
        StoredRow {
            content_hash: hash.to_string(),
            payload: json!({}),
            unified_text: String::new(),
            embedding: vec![0.0],
            updated_at_epoch_ms: 0,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unchanged_hash_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.insert_row("same", stored("H1"));
        store.insert_row("changed", stored("H1"));
        let detector = ChangeDetector::new(store.clone());

        let changes = detector
            .partition(vec![
                candidate("same", "H1"),
                candidate("changed", "H2"),
                candidate("new", "H3"),
            ])
            .await
            .expect("partition");

        assert_eq!(changes.skipped, 1);
        assert_eq!(
            changes.to_process,
            vec![candidate("changed", "H2"), candidate("new", "H3")]
        );
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_chunk_does_not_query() {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone());
        let changes = detector.partition(Vec::new()).await.unwrap();
        assert_eq!(changes, ChangeSet::default());
        assert_eq!(store.lookups(), 0);
    }
}

//! Persistence of embedded records, keyed by stable identifier.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::IngestError;
use crate::fingerprint::CandidateRecord;

pub use memory::{MemoryStore, StoredRow};
pub use postgres::PgVectorStore;

/// Batched hash lookup plus transactional upsert.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns `stable_id -> content_hash` for every id that has a stored row,
    /// using a single round-trip.
    async fn fetch_hashes(&self, ids: &[String]) -> Result<HashMap<String, String>, IngestError>;

    /// Inserts or overwrites every record of `batch` with its embedding,
    /// all-or-nothing. `embeddings[i]` belongs to `batch[i]`.
    async fn upsert(
        &self,
        batch: &[CandidateRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<(), IngestError>;
}

pub(crate) fn ensure_aligned(
    batch: &[CandidateRecord],
    embeddings: &[Vec<f32>],
) -> Result<(), IngestError> {
    if batch.len() != embeddings.len() {
        return Err(IngestError::validation(format!(
            "batch has {} records but {} embeddings",
            batch.len(),
            embeddings.len()
        )));
    }
    Ok(())
}

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

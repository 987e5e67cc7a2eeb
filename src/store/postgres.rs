//! Postgres + pgvector implementation of [`RecordStore`].
//!
//! Lookups run as unnamed statements (`query_typed`) and the upsert statement
//! is prepared inside the batch transaction and closed before commit, so no
//! server-side prepared statement outlives a transaction. That keeps the store
//! usable behind a transaction-pooling proxy such as pgbouncer.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use pgvector::Vector;
use tokio_postgres::types::{Json, ToSql, Type};
use tokio_postgres::NoTls;
use tracing::debug;

use crate::error::IngestError;
use crate::fingerprint::CandidateRecord;
use crate::store::{ensure_aligned, RecordStore, TableName};

/// Pooled pgvector-backed store.
#[derive(Clone)]
pub struct PgVectorStore {
    pool: Pool,
    table: TableName,
    lookup_sql: String,
    upsert_sql: String,
}

impl PgVectorStore {
    /// Builds a lazily-connecting pool of at most `pool_size` connections.
    pub fn connect(database_url: &str, pool_size: usize, table: TableName) -> Result<Self> {
        let pg_config: tokio_postgres::Config =
            database_url.parse().context("invalid Postgres connection string")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .context("failed to build Postgres pool")?;
        Ok(Self {
            pool,
            lookup_sql: lookup_sql(&table),
            upsert_sql: upsert_sql(&table),
            table,
        })
    }

    /// Creates the vector extension and the record table when missing.
    pub async fn prepare(&self, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        let client = self
            .pool
            .get()
            .await
            .context("failed to check out a Postgres connection")?;
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await
            .context("failed to ensure pgvector extension")?;
        client
            .batch_execute(&table_ddl(&self.table, dims))
            .await
            .with_context(|| format!("failed to create {}", self.table.qualified()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgVectorStore {
    async fn fetch_hashes(&self, ids: &[String]) -> Result<HashMap<String, String>, IngestError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|err| IngestError::persistence("checkout connection", err))?;
        let params: [(&(dyn ToSql + Sync), Type); 1] = [(&ids, Type::TEXT_ARRAY)];
        let rows = client
            .query_typed(&self.lookup_sql, &params)
            .await
            .map_err(|err| IngestError::persistence("lookup hashes", err))?;
        let mut hashes = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get(0)
                .map_err(|err| IngestError::persistence("decode stable_id", err))?;
            let hash: String = row
                .try_get(1)
                .map_err(|err| IngestError::persistence("decode content_hash", err))?;
            hashes.insert(id, hash);
        }
        debug!(requested = ids.len(), found = hashes.len(), "looked up stored hashes");
        Ok(hashes)
    }

    async fn upsert(
        &self,
        batch: &[CandidateRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<(), IngestError> {
        ensure_aligned(batch, embeddings)?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|err| IngestError::persistence("checkout connection", err))?;
        let transaction = client
            .transaction()
            .await
            .map_err(|err| IngestError::persistence("begin transaction", err))?;
        let statement = transaction
            .prepare(&self.upsert_sql)
            .await
            .map_err(|err| IngestError::persistence("prepare upsert", err))?;
        for (record, embedding) in batch.iter().zip(embeddings) {
            let vector = Vector::from(embedding.clone());
            let payload = Json(&record.payload);
            transaction
                .execute(
                    &statement,
                    &[
                        &record.stable_id,
                        &record.content_hash,
                        &payload,
                        &record.unified_text,
                        &vector,
                    ],
                )
                .await
                .map_err(|err| IngestError::persistence("upsert row", err))?;
        }
        drop(statement);
        transaction
            .commit()
            .await
            .map_err(|err| IngestError::persistence("commit upsert", err))?;
        Ok(())
    }
}

fn table_ddl(table: &TableName, dims: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            stable_id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            payload JSONB NOT NULL,
            unified_text TEXT NOT NULL,
            embedding VECTOR({dims}) NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        table.qualified()
    )
}

fn lookup_sql(table: &TableName) -> String {
    format!(
        "SELECT stable_id, content_hash FROM {} WHERE stable_id = ANY($1)",
        table.qualified()
    )
}

fn upsert_sql(table: &TableName) -> String {
    format!(
        "INSERT INTO {} \
            (stable_id, content_hash, payload, unified_text, embedding, updated_at) \
            VALUES ($1, $2, $3, $4, $5, now()) \
            ON CONFLICT (stable_id) DO UPDATE SET \
                content_hash = EXCLUDED.content_hash, \
                payload = EXCLUDED.payload, \
                unified_text = EXCLUDED.unified_text, \
                embedding = EXCLUDED.embedding, \
                updated_at = now()",
        table.qualified()
    )
}

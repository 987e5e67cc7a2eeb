//! Command-line and environment configuration for the ingestor.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::embedder::RetryPolicy;
use crate::sources::{FetchPolicy, Pagination};
use crate::store::TableName;

/// Command-line interface of the ingestor binary; every flag falls back to an env var.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fastingest",
    about = "Incremental multi-source ingestion into pgvector"
)]
pub struct IngestCli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the text-embeddings-inference service
    #[arg(long, env = "TEI_URL")]
    pub tei_url: String,

    /// Records per batch handed to the scheduler
    #[arg(long, env = "BATCH_SIZE", default_value_t = 128)]
    pub batch_size: usize,

    /// Batches processed concurrently
    #[arg(long, env = "CONCURRENCY", default_value_t = 6)]
    pub concurrency: usize,

    /// Texts per TEI request
    #[arg(long, env = "TEI_MAX_BATCH", default_value_t = 32)]
    pub tei_max_batch: usize,

    /// Per-request TEI timeout in seconds
    #[arg(long, env = "TEI_TIMEOUT", default_value_t = 60)]
    pub tei_timeout_secs: u64,

    /// Attempts per TEI sub-batch
    #[arg(long, env = "TEI_MAX_RETRIES", default_value_t = 5)]
    pub tei_max_retries: usize,

    /// Seconds after which TEI retries stop regardless of attempts left
    #[arg(long, env = "TEI_MAX_ELAPSED", default_value_t = 60)]
    pub tei_max_elapsed_secs: u64,

    /// Dimension every embedding must have
    #[arg(long, env = "EXPECTED_EMBEDDING_DIM", default_value_t = 384)]
    pub embedding_dim: usize,

    /// Postgres schema holding the record table
    #[arg(long, env = "INGEST_PG_SCHEMA", default_value = "public")]
    pub pg_schema: String,

    /// Record table name
    #[arg(long, env = "INGEST_PG_TABLE", default_value = "records")]
    pub pg_table: String,

    /// Create the vector extension and record table at startup
    #[arg(
        long,
        env = "INGEST_PG_PREPARE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub pg_prepare: bool,

    /// Maximum pooled Postgres connections (0 = twice the concurrency)
    #[arg(long, env = "INGEST_PG_POOL_SIZE", default_value_t = 0)]
    pub pg_pool_size: usize,

    /// Source API URLs, comma separated
    #[arg(long, env = "INGEST_SOURCE_URLS", default_value = "")]
    pub source_urls: String,

    /// Key sent to every source as `apikey` and bearer token
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Page size for paginated sources (0 = single request)
    #[arg(long, env = "INGEST_SOURCE_PAGE_SIZE", default_value_t = 0)]
    pub source_page_size: usize,

    /// Maximum pages fetched per source and cycle
    #[arg(long, env = "INGEST_SOURCE_MAX_PAGES", default_value_t = 10)]
    pub source_max_pages: usize,

    /// Source requests allowed per second across all sources
    #[arg(long, env = "SOURCES_RATE_PER_SEC", default_value_t = 10)]
    pub sources_rate_per_sec: u32,

    /// Per-attempt source timeout in seconds
    #[arg(long, env = "SOURCE_FETCH_TIMEOUT", default_value_t = 20)]
    pub source_timeout_secs: u64,

    /// Attempts per source and cycle
    #[arg(long, env = "SOURCE_MAX_RETRIES", default_value_t = 3)]
    pub source_max_retries: usize,

    /// Field whose value identifies a record
    #[arg(long, env = "IDENTIFIER_KEY", default_value = "email")]
    pub identifier_key: String,

    /// Fields tried in order to detect cross-source duplicates, comma separated
    #[arg(long, env = "INGEST_DEDUP_FIELDS", default_value = "dni,correo,id,documento")]
    pub dedup_fields: String,

    /// Bind address of the health/metrics server (empty disables it)
    #[arg(long, env = "INGEST_HEALTH_BIND", default_value = "0.0.0.0:9001")]
    pub health_bind: String,

    /// Milliseconds to sleep after a cycle that fetched nothing
    #[arg(long, env = "INGEST_IDLE_MS", default_value_t = 1000)]
    pub idle_ms: u64,

    /// Milliseconds to sleep after a failed cycle
    #[arg(long, env = "INGEST_ERROR_BACKOFF_MS", default_value_t = 2000)]
    pub error_backoff_ms: u64,

    /// Seconds to wait for in-flight batches on shutdown
    #[arg(long, env = "INGEST_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Emit JSON log lines instead of human-readable output
    #[arg(long, env = "INGEST_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Settings for the source side of a cycle.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Exact URLs fetched every cycle.
    pub urls: Vec<String>,
    /// Shared API key, if any.
    pub api_key: Option<String>,
    /// Pagination applied to every URL, if enabled.
    pub pagination: Option<Pagination>,
    /// Request budget across all sources.
    pub rate_per_sec: u32,
    /// Per-source retry envelope.
    pub fetch: FetchPolicy,
    /// Cross-source duplicate keys, in priority order.
    pub dedup_fields: Vec<String>,
}

/// Settings for the inference client.
#[derive(Debug, Clone)]
pub struct TeiSettings {
    /// Service base URL.
    pub url: String,
    /// Texts per request.
    pub max_batch: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry envelope per sub-batch.
    pub retry: RetryPolicy,
    /// Required embedding dimension.
    pub embedding_dim: usize,
}

/// Settings for the Postgres store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Connection string.
    pub database_url: String,
    /// Target table.
    pub table: TableName,
    /// Pool size, already resolved.
    pub pool_size: usize,
    /// Whether to run DDL at startup.
    pub prepare: bool,
}

/// Settings for the cycle loop.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Field hashed into the stable identifier.
    pub identifier_field: String,
    /// Records per batch.
    pub batch_size: usize,
    /// Batches in flight.
    pub concurrency: usize,
    /// Sleep after an empty cycle.
    pub idle_sleep: Duration,
    /// Sleep after a failed cycle.
    pub error_backoff: Duration,
    /// Drain deadline on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            identifier_field: "email".to_string(),
            batch_size: 128,
            concurrency: 6,
            idle_sleep: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(2000),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Validated, immutable process configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Source fan-out.
    pub sources: SourceSettings,
    /// Inference client.
    pub tei: TeiSettings,
    /// Record store.
    pub store: StoreSettings,
    /// Cycle loop.
    pub pipeline: PipelineSettings,
    /// Health server address, when enabled.
    pub health_bind: Option<SocketAddr>,
}

impl IngestConfig {
    /// Validates the parsed CLI and resolves derived values.
    pub fn from_cli(cli: &IngestCli) -> Result<Self> {
        anyhow::ensure!(!cli.database_url.trim().is_empty(), "DATABASE_URL is required");
        anyhow::ensure!(!cli.tei_url.trim().is_empty(), "TEI_URL is required");
        anyhow::ensure!(cli.batch_size > 0, "batch size must be positive");
        anyhow::ensure!(cli.concurrency > 0, "concurrency must be positive");
        anyhow::ensure!(cli.tei_max_batch > 0, "TEI max batch must be positive");
        anyhow::ensure!(cli.tei_max_retries > 0, "TEI retries must be positive");
        anyhow::ensure!(cli.embedding_dim > 0, "embedding dimension must be positive");
        anyhow::ensure!(cli.source_max_retries > 0, "source retries must be positive");
        anyhow::ensure!(cli.sources_rate_per_sec > 0, "source rate must be positive");
        anyhow::ensure!(
            !cli.identifier_key.trim().is_empty(),
            "identifier key is required"
        );

        let min_pool = cli.concurrency * 2;
        let pool_size = match cli.pg_pool_size {
            0 => min_pool,
            size => {
                anyhow::ensure!(
                    size >= min_pool,
                    "pool size {size} is below twice the concurrency ({min_pool})"
                );
                size
            }
        };

        let health_bind = match cli.health_bind.trim() {
            "" => None,
            addr => Some(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid health bind address {addr}"))?,
            ),
        };

        let urls = split_list(&cli.source_urls);
        for url in &urls {
            anyhow::ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "source URL must be an http(s) URL: {url}"
            );
        }

        Ok(Self {
            sources: SourceSettings {
                urls,
                api_key: cli
                    .api_key
                    .as_deref()
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string),
                pagination: (cli.source_page_size > 0)
                    .then(|| Pagination::new(cli.source_page_size, cli.source_max_pages)),
                rate_per_sec: cli.sources_rate_per_sec,
                fetch: FetchPolicy {
                    max_attempts: cli.source_max_retries,
                    attempt_timeout: Duration::from_secs(cli.source_timeout_secs.max(1)),
                    ..FetchPolicy::default()
                },
                dedup_fields: split_list(&cli.dedup_fields),
            },
            tei: TeiSettings {
                url: cli.tei_url.trim().to_string(),
                max_batch: cli.tei_max_batch,
                timeout: Duration::from_secs(cli.tei_timeout_secs.max(1)),
                retry: RetryPolicy {
                    max_attempts: cli.tei_max_retries,
                    max_elapsed: Duration::from_secs(cli.tei_max_elapsed_secs),
                    ..RetryPolicy::default()
                },
                embedding_dim: cli.embedding_dim,
            },
            store: StoreSettings {
                database_url: cli.database_url.clone(),
                table: TableName::new(cli.pg_schema.clone(), cli.pg_table.clone())?,
                pool_size,
                prepare: cli.pg_prepare,
            },
            pipeline: PipelineSettings {
                identifier_field: cli.identifier_key.trim().to_string(),
                batch_size: cli.batch_size,
                concurrency: cli.concurrency,
                idle_sleep: Duration::from_millis(cli.idle_ms),
                error_backoff: Duration::from_millis(cli.error_backoff_ms),
                shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            },
            health_bind,
        })
    }
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(extra: &[&str]) -> IngestCli {
        let mut args = vec![
            "fastingest",
            "--database-url",
            "postgres://ingest@localhost/ingest",
            "--tei-url",
            "http://tei:8080/",
        ];
        args.extend_from_slice(extra);
        IngestCli::try_parse_from(args).expect("cli parses")
    }

    #[test]
    fn defaults_resolve() {
        let config = IngestConfig::from_cli(&parse(&[])).expect("config");
        assert_eq!(config.pipeline.batch_size, 128);
        assert_eq!(config.pipeline.concurrency, 6);
        assert_eq!(config.store.pool_size, 12);
        assert!(config.store.prepare);
        assert_eq!(config.tei.max_batch, 32);
        assert_eq!(config.tei.retry.max_attempts, 5);
        assert_eq!(config.tei.embedding_dim, 384);
        assert_eq!(
            config.sources.dedup_fields,
            vec!["dni", "correo", "id", "documento"]
        );
        assert!(config.sources.pagination.is_none());
        assert_eq!(config.health_bind, Some("0.0.0.0:9001".parse().unwrap()));
    }

    #[test]
    fn lists_and_pagination_are_parsed() {
        let cli = parse(&[
            "--source-urls",
            "https://a.test/people, https://b.test/rows ,",
            "--source-page-size",
            "50",
            "--health-bind",
            "",
            "--api-key",
            "  ",
        ]);
        let config = IngestConfig::from_cli(&cli).expect("config");
        assert_eq!(
            config.sources.urls,
            vec!["https://a.test/people", "https://b.test/rows"]
        );
        assert_eq!(
            config.sources.pagination.as_ref().map(|p| p.page_size),
            Some(50)
        );
        assert_eq!(config.health_bind, None);
        assert_eq!(config.sources.api_key, None);
    }

    #[test]
    fn undersized_pool_is_rejected() {
        let cli = parse(&["--concurrency", "4", "--pg-pool-size", "5"]);
        let err = IngestConfig::from_cli(&cli).expect_err("pool too small");
        assert!(err.to_string().contains("twice the concurrency"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(IngestConfig::from_cli(&parse(&["--batch-size", "0"])).is_err());
        assert!(IngestConfig::from_cli(&parse(&["--source-urls", "ftp://x"])).is_err());
        assert!(IngestConfig::from_cli(&parse(&["--pg-prepare", "false"]))
            .map(|config| !config.store.prepare)
            .unwrap_or(false));
    }
}

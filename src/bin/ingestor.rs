use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fastingest::embedder::{Embedder, TeiEmbedder};
use fastingest::sources::{api_key_headers, GenericApiSource, SourceAdapter, SourceAggregator};
use fastingest::store::{PgVectorStore, RecordStore};
use fastingest::{health, IngestCli, IngestConfig, Ingestor, Metrics, RateLimiter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = IngestCli::parse();
    init_tracing(cli.log_json);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ingestor failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: IngestCli) -> Result<()> {
    let config = IngestConfig::from_cli(&cli).context("invalid configuration")?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let store = PgVectorStore::connect(
        &config.store.database_url,
        config.store.pool_size,
        config.store.table.clone(),
    )?;
    if config.store.prepare {
        store
            .prepare(config.tei.embedding_dim)
            .await
            .context("failed to prepare record table")?;
    }
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let embedder: Arc<dyn Embedder> = Arc::new(TeiEmbedder::new(
        &config.tei.url,
        config.tei.max_batch,
        config.tei.embedding_dim,
        config.tei.timeout,
        config.tei.retry,
        Arc::clone(&metrics),
    )?);

    let headers = api_key_headers(config.sources.api_key.as_deref())?;
    let mut sources: Vec<Arc<dyn SourceAdapter>> = Vec::with_capacity(config.sources.urls.len());
    for url in &config.sources.urls {
        let mut source =
            GenericApiSource::new(url.clone(), headers.clone(), config.sources.fetch.attempt_timeout)?;
        if let Some(pagination) = &config.sources.pagination {
            source = source.with_pagination(pagination.clone());
        }
        sources.push(Arc::new(source));
    }
    if sources.is_empty() {
        info!("no sources configured; cycles will stay idle");
    }
    let aggregator = SourceAggregator::new(
        sources,
        RateLimiter::per_second(config.sources.rate_per_sec),
        config.sources.fetch,
        config.sources.dedup_fields.clone(),
        Arc::clone(&metrics),
    );

    if let Some(addr) = config.health_bind {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(err) = health::serve(addr, metrics).await {
                error!(error = %format!("{err:#}"), "health server stopped");
            }
        });
    }

    let ingestor = Ingestor::new(
        config.pipeline.clone(),
        aggregator,
        embedder,
        store,
        Arc::clone(&metrics),
    );
    ingestor
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let snapshot = metrics.snapshot();
    info!(
        cycles = snapshot.cycles,
        batches_processed = snapshot.batches_processed,
        batches_failed = snapshot.batches_failed,
        records_processed = snapshot.records_processed,
        "ingestor stopped"
    );
    Ok(())
}

//! The ingestion cycle: fetch, fingerprint, detect changes, dispatch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::change::ChangeDetector;
use crate::config::PipelineSettings;
use crate::embedder::Embedder;
use crate::fingerprint::CandidateRecord;
use crate::metrics::Metrics;
use crate::scheduler::BatchScheduler;
use crate::sources::SourceAggregator;
use crate::store::RecordStore;

/// Counts gathered over one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records returned by the aggregator after cross-source dedup.
    pub fetched: usize,
    /// Records dropped for lacking an identifier.
    pub rejected: usize,
    /// Records sharing a stable id with an earlier record of the cycle.
    pub duplicate_ids: usize,
    /// Records not dispatched: stored hash unchanged, or the same version
    /// already owned by a running batch.
    pub skipped: usize,
    /// Part of `skipped` that was owned by a running batch.
    pub in_flight: usize,
    /// Batches handed to the scheduler.
    pub batches: usize,
    /// Records inside those batches.
    pub dispatched: usize,
}

/// Owns every stage of the pipeline and runs cycles until shutdown.
pub struct Ingestor {
    settings: PipelineSettings,
    aggregator: SourceAggregator,
    detector: ChangeDetector,
    scheduler: BatchScheduler,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    /// Wires the stages together around a shared store and embedder.
    pub fn new(
        settings: PipelineSettings,
        aggregator: SourceAggregator,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let settings = PipelineSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        Self {
            detector: ChangeDetector::new(Arc::clone(&store)),
            scheduler: BatchScheduler::new(
                settings.concurrency,
                embedder,
                store,
                Arc::clone(&metrics),
            ),
            settings,
            aggregator,
            metrics,
        }
    }

    /// Runs one cycle. Returns once every batch is dispatched; batches keep
    /// running in the background.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();
        self.metrics.record_cycle();
        let wrappers = self.aggregator.fetch_all().await;
        let mut report = CycleReport {
            fetched: wrappers.len(),
            ..CycleReport::default()
        };

        let mut seen = HashSet::with_capacity(wrappers.len());
        let mut candidates = Vec::with_capacity(wrappers.len());
        for wrapper in wrappers {
            let source = wrapper.source.clone();
            match CandidateRecord::from_wrapper(wrapper, &self.settings.identifier_field) {
                Ok(candidate) => {
                    if seen.insert(candidate.stable_id.clone()) {
                        candidates.push(candidate);
                    } else {
                        report.duplicate_ids += 1;
                    }
                }
                Err(err) => {
                    report.rejected += 1;
                    self.metrics.record_rejected();
                    warn!(source = %source, error = %err, "record rejected");
                }
            }
        }
        if report.duplicate_ids > 0 {
            self.metrics.record_duplicate_ids(report.duplicate_ids);
            debug!(records = report.duplicate_ids, "dropped records with repeated stable id");
        }

        let mut remaining = candidates.into_iter();
        loop {
            let chunk: Vec<CandidateRecord> =
                remaining.by_ref().take(self.settings.batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            let changes = self.detector.partition(chunk).await?;
            let (to_process, running) = self.scheduler.without_in_flight(changes.to_process);
            let skipped = changes.skipped + running;
            if skipped > 0 {
                self.metrics.record_skipped(skipped);
            }
            report.skipped += skipped;
            report.in_flight += running;
            if to_process.is_empty() {
                continue;
            }
            report.batches += 1;
            report.dispatched += to_process.len();
            self.scheduler.dispatch(to_process).await?;
        }

        info!(
            event = "cycle_done",
            fetched = report.fetched,
            rejected = report.rejected,
            skipped = report.skipped,
            batches = report.batches,
            records = report.dispatched,
            took_ms = started.elapsed().as_millis() as u64,
            "cycle dispatched"
        );
        Ok(report)
    }

    /// Loops over cycles until `shutdown` resolves, then drains in-flight
    /// batches within the configured grace period. A cycle that dispatched
    /// nothing is followed by the idle sleep, a failed one by the error backoff.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            sources = self.aggregator.source_count(),
            batch_size = self.settings.batch_size,
            concurrency = self.settings.concurrency,
            "ingestor started"
        );
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.run_cycle() => outcome,
            };
            let pause = match outcome {
                Ok(report) if report.batches == 0 => Some(self.settings.idle_sleep),
                Ok(_) => None,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "cycle failed");
                    Some(self.settings.error_backoff)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        info!("shutdown requested");
        let aborted = self.scheduler.shutdown(self.settings.shutdown_grace).await;
        if aborted > 0 {
            warn!(aborted, "batches aborted during shutdown");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::limiter::RateLimiter;
    use crate::sources::{FetchPolicy, SourceAdapter, SourceWrapper};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves whatever records the test put in it.
    #[derive(Default)]
    struct ScriptedSource {
        records: Mutex<Vec<Value>>,
    }

    impl ScriptedSource {
        fn set(&self, records: Vec<Value>) {
            *self.records.lock().unwrap() = records;
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn label(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self) -> anyhow::Result<Vec<SourceWrapper>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(|raw| SourceWrapper::new(raw, "scripted"))
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingEmbedder {
        delay: Duration,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            Ok(texts.iter().map(|text| vec![text.len() as f32, 1.0]).collect())
        }
    }

    /// Lookup always fails, as when the database is unreachable.
    struct DownStore;

    #[async_trait]
    impl RecordStore for DownStore {
        async fn fetch_hashes(
            &self,
            _ids: &[String],
        ) -> Result<HashMap<String, String>, IngestError> {
            Err(IngestError::persistence("hash lookup", "connection refused"))
        }

        async fn upsert(
            &self,
            _batch: &[CandidateRecord],
            _embeddings: &[Vec<f32>],
        ) -> Result<(), IngestError> {
            Ok(())
        }
    }

    struct Harness {
        source: Arc<ScriptedSource>,
        embedder: Arc<CountingEmbedder>,
        store: Arc<MemoryStore>,
        metrics: Arc<Metrics>,
        ingestor: Ingestor,
    }

    fn harness(batch_size: usize) -> Harness {
        harness_with(batch_size, 2, Duration::ZERO)
    }

    fn harness_with(batch_size: usize, concurrency: usize, embed_delay: Duration) -> Harness {
        let source = Arc::new(ScriptedSource::default());
        let embedder = Arc::new(CountingEmbedder {
            delay: embed_delay,
            ..CountingEmbedder::default()
        });
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let aggregator = SourceAggregator::new(
            vec![source.clone() as Arc<dyn SourceAdapter>],
            RateLimiter::per_second(1_000),
            FetchPolicy::default(),
            vec!["email".to_string()],
            Arc::clone(&metrics),
        );
        let settings = PipelineSettings {
            batch_size,
            concurrency,
            idle_sleep: Duration::from_millis(10),
            ..PipelineSettings::default()
        };
        let ingestor = Ingestor::new(
            settings,
            aggregator,
            embedder.clone(),
            store.clone(),
            Arc::clone(&metrics),
        );
        Harness {
            source,
            embedder,
            store,
            metrics,
            ingestor,
        }
    }

    fn person(n: usize) -> Value {
        json!({"email": format!("user{n}@example.com"), "nombre": format!("User {n}")})
    }

    #[tokio::test(flavor = "current_thread")]
    async fn second_cycle_skips_unchanged_records() {
        let mut h = harness(2);
        h.source.set((0..5).map(person).collect());

        let first = h.ingestor.run_cycle().await.expect("first cycle");
        h.ingestor.scheduler.drain().await;
        assert_eq!(first.batches, 3);
        assert_eq!(first.dispatched, 5);
        assert_eq!(h.store.len(), 5);
        assert_eq!(h.embedder.texts.load(Ordering::SeqCst), 5);

        let calls_before = h.embedder.calls.load(Ordering::SeqCst);
        let second = h.ingestor.run_cycle().await.expect("second cycle");
        h.ingestor.scheduler.drain().await;
        assert_eq!(second.skipped, 5);
        assert_eq!(second.batches, 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(h.store.len(), 5);
        assert_eq!(h.metrics.snapshot().records_skipped, 5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn one_lookup_per_chunk() {
        let mut h = harness(2);
        h.source.set((0..5).map(person).collect());
        h.ingestor.run_cycle().await.unwrap();
        h.ingestor.scheduler.drain().await;
        assert_eq!(h.store.lookups(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn changed_record_is_re_embedded() {
        let mut h = harness(10);
        h.source.set(vec![person(1), person(2)]);
        h.ingestor.run_cycle().await.unwrap();
        h.ingestor.scheduler.drain().await;
        let before = h.store.row(&crate::fingerprint::stable_id_for("user1@example.com"));

        h.source.set(vec![
            json!({"email": "user1@example.com", "nombre": "Renamed"}),
            person(2),
        ]);
        let report = h.ingestor.run_cycle().await.unwrap();
        h.ingestor.scheduler.drain().await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 1);
        let after = h
            .store
            .row(&crate::fingerprint::stable_id_for("user1@example.com"))
            .expect("row");
        assert_ne!(before.map(|row| row.content_hash), Some(after.content_hash));
        assert_eq!(after.payload["nombre"], "Renamed");
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn records_without_identifier_are_rejected() {
        let mut h = harness(10);
        h.source.set(vec![person(1), json!({"nombre": "sin correo"})]);
        let report = h.ingestor.run_cycle().await.unwrap();
        h.ingestor.scheduler.drain().await;

        assert_eq!(report.rejected, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.metrics.snapshot().records_rejected, 1);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repeated_identifier_is_embedded_once() {
        let mut h = harness(10);
        h.source.set(vec![
            json!({"email": "Same@Example.com", "nombre": "first"}),
            json!({"email": "same@example.com ", "nombre": "second"}),
        ]);
        let report = h.ingestor.run_cycle().await.unwrap();
        h.ingestor.scheduler.drain().await;

        assert_eq!(report.duplicate_ids, 1);
        assert_eq!(h.metrics.snapshot().duplicate_ids, 1);
        assert_eq!(h.metrics.snapshot().duplicates_dropped, 0);
        assert_eq!(h.store.len(), 1);
        let row = h
            .store
            .row(&crate::fingerprint::stable_id_for("same@example.com"))
            .expect("row");
        assert_eq!(row.payload["nombre"], "first");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_cycle_dispatches_nothing() {
        let mut h = harness(10);
        let report = h.ingestor.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.lookups(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lookup_failure_fails_the_cycle() {
        let source = Arc::new(ScriptedSource::default());
        source.set(vec![person(1)]);
        let metrics = Arc::new(Metrics::new().unwrap());
        let aggregator = SourceAggregator::new(
            vec![source as Arc<dyn SourceAdapter>],
            RateLimiter::per_second(1_000),
            FetchPolicy::default(),
            Vec::new(),
            Arc::clone(&metrics),
        );
        let embedder = Arc::new(CountingEmbedder::default());
        let mut ingestor = Ingestor::new(
            PipelineSettings::default(),
            aggregator,
            embedder.clone(),
            Arc::new(DownStore),
            metrics,
        );

        let err = ingestor.run_cycle().await.expect_err("lookup fails");
        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_stops_on_shutdown_and_drains() {
        let h = harness(2);
        h.source.set((0..4).map(person).collect());
        let store = h.store.clone();
        let metrics = h.metrics.clone();

        h.ingestor
            .run(sleep(Duration::from_millis(200)))
            .await
            .expect("run");

        assert_eq!(store.len(), 4);
        assert!(metrics.snapshot().cycles >= 2);
        assert_eq!(metrics.snapshot().batches_failed, 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn record_in_a_running_batch_is_embedded_once() {
        let h = harness_with(10, 6, Duration::from_millis(500));
        h.source.set(vec![person(1)]);
        let embedder = h.embedder.clone();
        let store = h.store.clone();
        let metrics = h.metrics.clone();

        h.ingestor
            .run(sleep(Duration::from_millis(400)))
            .await
            .expect("run");

        assert_eq!(embedder.texts.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_processed, 1);
        assert!(snapshot.cycles >= 2);
        assert!(snapshot.records_skipped >= 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn running_version_is_reported_as_in_flight() {
        let mut h = harness_with(10, 6, Duration::from_millis(500));
        h.source.set(vec![person(1)]);

        let first = h.ingestor.run_cycle().await.unwrap();
        let second = h.ingestor.run_cycle().await.unwrap();
        assert_eq!(first.dispatched, 1);
        assert_eq!(second.in_flight, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.batches, 0);

        h.ingestor.scheduler.drain().await;
        let third = h.ingestor.run_cycle().await.unwrap();
        assert_eq!(third.in_flight, 0);
        assert_eq!(third.skipped, 1);
    }
}

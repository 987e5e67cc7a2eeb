//! Process-wide pipeline counters exposed on the `/metrics` endpoint.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Prometheus collectors shared by the loop and every batch task.
///
/// Each instance owns its registry, so tests can build as many as they like.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    cycles: IntCounter,
    batches_processed: IntCounter,
    batches_failed: IntCounter,
    records_processed: IntCounter,
    records_skipped: IntCounter,
    records_rejected: IntCounter,
    duplicates_dropped: IntCounter,
    duplicate_ids: IntCounter,
    inference_calls: IntCounter,
    batch_seconds: Histogram,
}

/// Point-in-time copy of the counters in [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Aggregation cycles started.
    pub cycles: u64,
    /// Batches embedded and committed.
    pub batches_processed: u64,
    /// Batches abandoned after an error.
    pub batches_failed: u64,
    /// Records committed to the store.
    pub records_processed: u64,
    /// Records skipped because their hash was unchanged or already in flight.
    pub records_skipped: u64,
    /// Records dropped because they could not be fingerprinted.
    pub records_rejected: u64,
    /// Records collapsed by cross-source deduplication.
    pub duplicates_dropped: u64,
    /// Records sharing a stable id with an earlier record of the same cycle.
    pub duplicate_ids: u64,
    /// HTTP calls made to the inference service.
    pub inference_calls: u64,
    /// Batch durations observed by the histogram.
    pub batch_timings: u64,
}

impl Metrics {
    /// Builds and registers every collector.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let cycles = counter("ingestor_cycles_total", "Aggregation cycles started")?;
        let batches_processed =
            counter("ingestor_batches_processed_total", "Total batches processed")?;
        let batches_failed = counter("ingestor_batches_failed_total", "Total batches abandoned")?;
        let records_processed =
            counter("ingestor_records_processed_total", "Total records processed")?;
        let records_skipped = counter(
            "ingestor_records_skipped_total",
            "Records skipped as unchanged or in flight",
        )?;
        let records_rejected =
            counter("ingestor_records_rejected_total", "Records without identifier")?;
        let duplicates_dropped = counter(
            "ingestor_duplicates_dropped_total",
            "Records dropped by cross-source dedup",
        )?;
        let duplicate_ids = counter(
            "ingestor_duplicate_ids_total",
            "Records repeating a stable id within a cycle",
        )?;
        let inference_calls = counter("ingestor_tei_calls_total", "Total TEI calls")?;

        let batch_seconds = Histogram::with_opts(HistogramOpts::new(
            "ingestor_batch_process_seconds",
            "Seconds per batch",
        ))?;
        registry.register(Box::new(batch_seconds.clone()))?;

        Ok(Self {
            registry,
            cycles,
            batches_processed,
            batches_failed,
            records_processed,
            records_skipped,
            records_rejected,
            duplicates_dropped,
            duplicate_ids,
            inference_calls,
            batch_seconds,
        })
    }

    /// Counts the start of an aggregation cycle.
    pub fn record_cycle(&self) {
        self.cycles.inc();
    }

    /// Counts a committed batch of `records` that took `took`.
    pub fn record_batch_processed(&self, records: usize, took: Duration) {
        self.batches_processed.inc();
        self.records_processed.inc_by(records as u64);
        self.batch_seconds.observe(took.as_secs_f64());
    }

    /// Counts an abandoned batch.
    pub fn record_batch_failed(&self) {
        self.batches_failed.inc();
    }

    /// Counts records that need no embedding this cycle.
    pub fn record_skipped(&self, records: usize) {
        self.records_skipped.inc_by(records as u64);
    }

    /// Counts records without a usable identifier.
    pub fn record_rejected(&self) {
        self.records_rejected.inc();
    }

    /// Counts records dropped by cross-source deduplication.
    pub fn record_duplicates(&self, records: usize) {
        self.duplicates_dropped.inc_by(records as u64);
    }

    /// Counts records whose stable id already appeared earlier in the cycle.
    pub fn record_duplicate_ids(&self, records: usize) {
        self.duplicate_ids.inc_by(records as u64);
    }

    /// Counts one HTTP call to the inference service.
    pub fn record_inference_call(&self) {
        self.inference_calls.inc();
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.get(),
            batches_processed: self.batches_processed.get(),
            batches_failed: self.batches_failed.get(),
            records_processed: self.records_processed.get(),
            records_skipped: self.records_skipped.get(),
            records_rejected: self.records_rejected.get(),
            duplicates_dropped: self.duplicates_dropped.get(),
            duplicate_ids: self.duplicate_ids.get(),
            inference_calls: self.inference_calls.get(),
            batch_timings: self.batch_seconds.get_sample_count(),
        }
    }

    /// Content type of [`Metrics::render`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Text exposition of every registered collector.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

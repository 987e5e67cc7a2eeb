//! Bounded fan-out of embed-and-upsert batch tasks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::embedder::Embedder;
use crate::error::IngestError;
use crate::fingerprint::CandidateRecord;
use crate::metrics::Metrics;
use crate::store::RecordStore;

/// Embeds one batch and commits it; record order is kept end to end.
pub async fn process_batch(
    embedder: &dyn Embedder,
    store: &dyn RecordStore,
    batch: &[CandidateRecord],
) -> Result<(), IngestError> {
    let texts: Vec<String> = batch
        .iter()
        .map(|record| record.unified_text.clone())
        .collect();
    let embeddings = embedder.embed(&texts).await?;
    if embeddings.len() != batch.len() {
        return Err(IngestError::validation(format!(
            "embedder returned {} vectors for {} records",
            embeddings.len(),
            batch.len()
        )));
    }
    store.upsert(batch, &embeddings).await
}

/// Dispatches batches as independent tasks, at most `concurrency` at a time.
pub struct BatchScheduler {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
    claims: InFlight,
    next_batch_id: u64,
}

/// `(stable_id, content_hash)` pairs owned by batches that have not finished.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<(String, String)>>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, batch: &[CandidateRecord]) -> InFlightClaim {
        let keys: Vec<(String, String)> = batch.iter().map(record_key).collect();
        self.lock().extend(keys.iter().cloned());
        InFlightClaim {
            owner: self.clone(),
            keys,
        }
    }
}

/// Releases its keys when the batch task ends, aborted or not.
struct InFlightClaim {
    owner: InFlight,
    keys: Vec<(String, String)>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut set = self.owner.lock();
        for key in &self.keys {
            set.remove(key);
        }
    }
}

fn record_key(record: &CandidateRecord) -> (String, String) {
    (record.stable_id.clone(), record.content_hash.clone())
}

impl BatchScheduler {
    /// Scheduler allowing `concurrency` batches in flight.
    pub fn new(
        concurrency: usize,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            embedder,
            store,
            metrics,
            claims: InFlight::default(),
            next_batch_id: 0,
        }
    }

    /// Waits for a free slot, then spawns the batch task and returns without
    /// waiting for it. Empty batches are ignored.
    pub async fn dispatch(&mut self, batch: Vec<CandidateRecord>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("batch semaphore closed"))?;
        self.reap_finished();

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let embedder = Arc::clone(&self.embedder);
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let claim = self.claims.claim(&batch);
        self.tasks.spawn(async move {
            let _permit = permit;
            let _claim = claim;
            let started = Instant::now();
            let records = batch.len();
            match process_batch(embedder.as_ref(), store.as_ref(), &batch).await {
                Ok(()) => {
                    let took = started.elapsed();
                    metrics.record_batch_processed(records, took);
                    info!(
                        event = "batch_processed",
                        batch_id,
                        records,
                        took_ms = took.as_millis() as u64,
                        "batch committed"
                    );
                }
                Err(err) => {
                    metrics.record_batch_failed();
                    error!(
                        event = "batch_error",
                        batch_id,
                        records,
                        kind = err.kind(),
                        error = %err,
                        "batch abandoned"
                    );
                }
            }
        });
        Ok(())
    }

    /// Drops records whose exact version is already owned by a running batch.
    /// Returns the remaining records and how many were dropped.
    pub fn without_in_flight(
        &self,
        batch: Vec<CandidateRecord>,
    ) -> (Vec<CandidateRecord>, usize) {
        let set = self.claims.lock();
        let total = batch.len();
        let kept: Vec<CandidateRecord> = batch
            .into_iter()
            .filter(|record| !set.contains(&record_key(record)))
            .collect();
        let dropped = total - kept.len();
        (kept, dropped)
    }

    /// Batches currently tracked (running or finished but not yet reaped).
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every tracked batch to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            log_join_failure(joined);
        }
    }

    /// Waits up to `grace` for outstanding batches, then aborts the rest.
    /// Returns how many batches were aborted.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        let pending = self.tasks.len();
        if pending == 0 {
            return 0;
        }
        info!(pending, grace_secs = grace.as_secs(), "waiting for in-flight batches");
        if timeout(grace, self.drain()).await.is_ok() {
            return 0;
        }
        let aborted = self.tasks.len();
        warn!(aborted, "aborting batches still running after grace period");
        self.tasks.shutdown().await;
        aborted
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            log_join_failure(joined);
        }
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "batch task panicked");
        }
    }
}

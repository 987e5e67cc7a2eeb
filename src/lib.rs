#![warn(missing_docs)]
//! Core library entry points for the fastingest pipeline.

pub mod change;
pub mod config;
pub mod document;
pub mod embedder;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod unifier;

pub use change::{ChangeDetector, ChangeSet};
pub use config::{IngestCli, IngestConfig, PipelineSettings};
pub use error::IngestError;
pub use fingerprint::{fingerprint, CandidateRecord, Fingerprint, FingerprintError};
pub use limiter::RateLimiter;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{CycleReport, Ingestor};
pub use scheduler::{process_batch, BatchScheduler};
pub use sources::{SourceAdapter, SourceAggregator, SourceWrapper};
pub use store::{MemoryStore, PgVectorStore, RecordStore, TableName};
pub use unifier::unify_text;

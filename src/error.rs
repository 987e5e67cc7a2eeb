//! Failure taxonomy for batch-level pipeline work.
//!
//! The scheduler uses the variant to decide what happens to a failed batch:
//! nothing is retried at batch level, but the variant ends up in logs and
//! metrics so operators can tell a flaky inference service from a dimension
//! misconfiguration.

use std::fmt;

/// Errors surfaced by the embedding client, the change detector and the store.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A source adapter failed; tolerated by the aggregator as "no data".
    #[error("source {source_label} failed: {message}")]
    Source {
        /// Origin label of the adapter.
        source_label: String,
        /// Rendered error chain.
        message: String,
    },

    /// The inference service could not be reached or kept failing after retries.
    #[error("inference call failed after {attempts} attempt(s): {message}")]
    Inference {
        /// Attempts made before giving up.
        attempts: usize,
        /// Last observed failure.
        message: String,
    },

    /// Malformed response shape, count mismatch or dimension mismatch.
    ///
    /// Never retried: the same request would produce the same mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lookup or upsert transaction failed.
    #[error("persistence failed: {context}: {message}")]
    Persistence {
        /// What the store was doing.
        context: &'static str,
        /// Underlying driver error.
        message: String,
    },
}

impl IngestError {
    /// Builds a validation error from anything displayable.
    pub fn validation(message: impl fmt::Display) -> Self {
        Self::Validation(message.to_string())
    }

    /// Wraps a database error with the operation that produced it.
    pub fn persistence(context: &'static str, err: impl fmt::Display) -> Self {
        Self::Persistence {
            context,
            message: err.to_string(),
        }
    }

    /// Short stable label used as the `kind` field in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::Inference { .. } => "inference",
            Self::Validation(_) => "validation",
            Self::Persistence { .. } => "persistence",
        }
    }
}

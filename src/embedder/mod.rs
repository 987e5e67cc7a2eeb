//! Embedding clients.

pub mod tei;

use async_trait::async_trait;

use crate::error::IngestError;

pub use tei::{RetryPolicy, TeiEmbedder};

/// Turns an ordered list of texts into one vector per text, same order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds `texts`; the output has exactly `texts.len()` vectors.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError>;
}

//! Content fingerprints used for idempotent upserts and change detection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::{canonical_json, find_field};
use crate::sources::SourceWrapper;
use crate::unifier::unify_text;

/// Stable identifier plus full-content hash of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// SHA-256 of the normalized identifying field value.
    pub stable_id: String,
    /// SHA-256 of the canonical payload serialization.
    pub content_hash: String,
}

/// Reasons a record cannot be fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// No non-empty value was found for the identifying field.
    #[error("identifying field `{field}` not found in record")]
    MissingIdentifier {
        /// Configured identifying field name.
        field: String,
    },
}

/// Computes the fingerprint of `raw` using `identifier_field` as the natural key.
pub fn fingerprint(raw: &Value, identifier_field: &str) -> Result<Fingerprint, FingerprintError> {
    let identifier =
        find_field(raw, identifier_field).ok_or_else(|| FingerprintError::MissingIdentifier {
            field: identifier_field.to_string(),
        })?;
    Ok(Fingerprint {
        stable_id: stable_id_for(&identifier),
        content_hash: content_hash(raw),
    })
}

/// Hash of the canonical serialization of the whole payload.
pub fn content_hash(raw: &Value) -> String {
    sha256_hex(canonical_json(raw).as_bytes())
}

/// Hash of a lower-cased, trimmed identifier value.
pub fn stable_id_for(identifier: &str) -> String {
    sha256_hex(identifier.trim().to_lowercase().as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A record ready for change detection, embedding and upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Natural key of the stored row.
    pub stable_id: String,
    /// Hash compared against the stored row to decide whether to re-embed.
    pub content_hash: String,
    /// Flattened text submitted to the embedding model.
    pub unified_text: String,
    /// Original payload persisted as JSONB.
    pub payload: Value,
}

impl CandidateRecord {
    /// Derives a candidate from a wrapped source record.
    ///
    /// Empty unified text is replaced by a single space so the inference
    /// service never receives an empty input.
    pub fn from_wrapper(
        wrapper: SourceWrapper,
        identifier_field: &str,
    ) -> Result<Self, FingerprintError> {
        let Fingerprint {
            stable_id,
            content_hash,
        } = fingerprint(&wrapper.raw, identifier_field)?;
        let mut unified_text = unify_text(&wrapper.raw);
        if unified_text.is_empty() {
            unified_text.push(' ');
        }
        Ok(Self {
            stable_id,
            content_hash,
            unified_text,
            payload: wrapper.raw,
        })
    }
}

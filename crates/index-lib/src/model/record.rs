//! Persisted form of a trained model
//!
//! A `ModelRecord` is the durable snapshot of a model: parameters plus
//! training metadata, protected by a SHA-256 checksum that is re-verified
//! on decode. A record that fails verification is treated as absent.

use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Training provenance stored alongside the parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub training_samples: u64,
    pub training_accuracy: f64,
    pub validation_accuracy: f64,
    pub trained_at_ms: u64,
}

/// Durable snapshot of a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub parameters: Vec<f64>,
    pub feature_dimensions: u32,
    pub metadata: ModelMetadata,
    pub checksum: String,
}

/// Borrowed view of everything the checksum covers
#[derive(Serialize)]
struct RecordPayload<'a> {
    parameters: &'a [f64],
    feature_dimensions: u32,
    metadata: &'a ModelMetadata,
}

impl ModelRecord {
    /// Build a record with its checksum filled in
    pub fn new(parameters: Vec<f64>, metadata: ModelMetadata) -> Self {
        let mut record = Self {
            parameters,
            feature_dimensions: 1,
            metadata,
            checksum: String::new(),
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// SHA-256 hex digest over all fields except the checksum itself
    pub fn compute_checksum(&self) -> String {
        let payload = RecordPayload {
            parameters: &self.parameters,
            feature_dimensions: self.feature_dimensions,
            metadata: &self.metadata,
        };
        // Struct serialization of plain numeric fields cannot fail
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    /// Whether the embedded checksum matches the record contents
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Encode for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|e| RecordError::Malformed(e.to_string()))
    }

    /// Decode and re-verify the checksum; mismatches are rejected
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let record: ModelRecord =
            serde_json::from_slice(bytes).map_err(|e| RecordError::Malformed(e.to_string()))?;

        let computed = record.compute_checksum();
        if computed != record.checksum {
            return Err(RecordError::Corrupt {
                stored: record.checksum,
                computed,
            });
        }

        Ok(record)
    }
}

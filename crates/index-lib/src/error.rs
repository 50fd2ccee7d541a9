//! Error types for the learned index subsystem

use thiserror::Error;

/// Errors from model training
#[derive(Debug, Error)]
pub enum TrainError {
    /// Fewer samples than the trainer can fit a line through
    #[error("insufficient training data: {got} samples, need at least {need}")]
    InsufficientData { got: usize, need: usize },

    /// The regression itself failed
    #[error("trainer failure: {0}")]
    Trainer(String),
}

/// Errors from decoding a persisted model record
#[derive(Debug, Error)]
pub enum RecordError {
    /// The embedded checksum does not match the record contents
    #[error("model record checksum mismatch: stored {stored}, computed {computed}")]
    Corrupt { stored: String, computed: String },

    /// The bytes could not be decoded at all
    #[error("malformed model record: {0}")]
    Malformed(String),
}

//! Error types for the hybrid byte model.
//!
//! Configuration errors surface at construction time, input errors at the
//! start of a forward pass. Numeric instability inside the recurrence is
//! guarded in place and never reported here.

use thiserror::Error;

/// Errors produced by model construction and forward evaluation.
#[derive(Error, Debug)]
pub enum CortexError {
    /// Configuration is invalid or internally inconsistent.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A byte id outside `[0, 255]` was supplied.
    #[error("Byte value {value} at position {position} is outside [0, 255]")]
    ByteOutOfRange { position: usize, value: u32 },

    /// A sequence exceeds the configured maximum length.
    #[error("Sequence length {len} exceeds maximum {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// The batch has no sequences or zero-length sequences.
    #[error("Empty batch")]
    EmptyBatch,

    /// Sequences of a batch do not share one length.
    #[error("Ragged batch: sequence {index} has length {len}, expected {expected}")]
    RaggedBatch {
        index: usize,
        len: usize,
        expected: usize,
    },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CortexError>;

impl CortexError {
    /// Whether this error comes from an invalid configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(self, CortexError::BadConfig(_))
    }

    /// Whether this error comes from malformed caller input.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CortexError::ByteOutOfRange { .. }
                | CortexError::SequenceTooLong { .. }
                | CortexError::EmptyBatch
                | CortexError::RaggedBatch { .. }
                | CortexError::ShapeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CortexError::SequenceTooLong { len: 20, max: 16 };
        let msg = e.to_string();
        assert!(msg.contains("20") && msg.contains("16"));

        let e = CortexError::ByteOutOfRange {
            position: 3,
            value: 300,
        };
        assert!(e.to_string().contains("300"));
    }

    #[test]
    fn test_error_classification() {
        assert!(CortexError::BadConfig("k > E".into()).is_config_error());
        assert!(!CortexError::BadConfig("k > E".into()).is_input_error());
        assert!(CortexError::EmptyBatch.is_input_error());
        assert!(CortexError::SequenceTooLong { len: 2, max: 1 }.is_input_error());
    }
}

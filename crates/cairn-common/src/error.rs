//! Error types for Cairn.

use thiserror::Error;

/// Result type alias using CairnError.
pub type Result<T> = std::result::Result<T, CairnError>;

/// Errors that can occur in Cairn operations.
#[derive(Debug, Error)]
pub enum CairnError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Callback errors
    #[error("callback failure: {0}")]
    Callback(String),

    #[error("object not found: object {object_number} offset {object_offset} length {object_length}")]
    ObjectNotFound {
        object_number: u64,
        object_offset: u64,
        object_length: u64,
    },

    // Serialization errors
    #[error("unpack did not reverse pack: packed {packed} bytes, consumed {consumed}")]
    SerializationMismatch { packed: usize, consumed: usize },

    #[error("node payload corrupted: {0}")]
    CorruptNode(String),

    #[error("node payload not exhausted: {remaining} trailing bytes")]
    TrailingPayload { remaining: usize },

    // Configuration errors
    #[error("invalid configuration: max_keys_per_node ({0}) must be an even number of at least 4")]
    InvalidConfiguration(u64),

    // Internal errors
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CairnError {
    /// Shorthand for an invariant-violation error carrying a formatted message.
    pub fn invariant(msg: impl Into<String>) -> Self {
        CairnError::InvariantViolation(msg.into())
    }

    /// Shorthand for a callback-failure error carrying a formatted message.
    pub fn callback(msg: impl Into<String>) -> Self {
        CairnError::Callback(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CairnError = io_err.into();
        assert!(matches!(err, CairnError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_callback_display() {
        let err = CairnError::callback("segment 12 unreachable");
        assert_eq!(err.to_string(), "callback failure: segment 12 unreachable");
    }

    #[test]
    fn test_object_not_found_display() {
        let err = CairnError::ObjectNotFound {
            object_number: 7,
            object_offset: 128,
            object_length: 64,
        };
        assert_eq!(
            err.to_string(),
            "object not found: object 7 offset 128 length 64"
        );
    }

    #[test]
    fn test_serialization_mismatch_display() {
        let err = CairnError::SerializationMismatch {
            packed: 12,
            consumed: 8,
        };
        assert_eq!(
            err.to_string(),
            "unpack did not reverse pack: packed 12 bytes, consumed 8"
        );
    }

    #[test]
    fn test_corrupt_node_display() {
        let err = CairnError::CorruptNode("truncated child reference".to_string());
        assert_eq!(
            err.to_string(),
            "node payload corrupted: truncated child reference"
        );

        let err = CairnError::TrailingPayload { remaining: 3 };
        assert_eq!(err.to_string(), "node payload not exhausted: 3 trailing bytes");
    }

    #[test]
    fn test_invalid_configuration_display() {
        let err = CairnError::InvalidConfiguration(3);
        assert_eq!(
            err.to_string(),
            "invalid configuration: max_keys_per_node (3) must be an even number of at least 4"
        );
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = CairnError::invariant("dirty child under clean parent");
        assert_eq!(
            err.to_string(),
            "invariant violation: dirty child under clean parent"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(CairnError::invariant("test"))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CairnError>();
    }
}

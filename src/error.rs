//! Error types for hipo-evio

use thiserror::Error;

/// Result type alias for record engine operations
pub type Result<T> = std::result::Result<T, EvioError>;

/// Errors raised while encoding, decoding, writing or editing evio data
#[derive(Error, Debug)]
pub enum EvioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic number, inconsistent lengths, truncated header or record.
    #[error("bad evio format: {0}")]
    Format(String),

    /// Record number check failed while scanning.
    #[error("bad record # sequence: expected {expected}, found {found}")]
    OutOfSequence { expected: u32, found: u32 },

    /// Caller supplied event bytes violate word alignment or size limits.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Codec failure or decompressed length mismatch.
    #[error("compression error: {0}")]
    Compression(String),

    /// The node describes bytes that were removed from its buffer.
    #[error("node is obsolete, its data was removed or the buffer was rescanned")]
    Obsolete,

    #[error("object closed")]
    Closed,
}

impl EvioError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        EvioError::Format(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        EvioError::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: EvioError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, EvioError::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn sequence_error_message() {
        let err = EvioError::OutOfSequence {
            expected: 2,
            found: 5,
        };
        assert_eq!(err.to_string(), "bad record # sequence: expected 2, found 5");
    }
}

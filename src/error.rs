use std::io;

use thiserror::Error;

use crate::encoding::EncodingError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Storage for a new domain, record or contact could not be reserved.
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Not found")]
    NotFound,

    /// Stale CSeq, or an equal CSeq outside the retransmission window.
    #[error("Invalid request: CSeq out of order")]
    Invalid,

    /// Equal CSeq inside the retransmission window.
    #[error("Retransmission within CSeq delay window")]
    Retransmission,

    #[error("Too many contacts registered for {aor}")]
    CapacityExceeded { aor: String },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    #[error("Buffer too small: {needed} entries needed")]
    BufferTooSmall { needed: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Corrupted journal: {0}")]
    CorruptedJournal(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Lookup outcomes that drive normal registrar control flow and are never
    /// logged as failures.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Error::NotFound | Error::Invalid | Error::Retransmission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flow_classification() {
        assert!(Error::NotFound.is_control_flow());
        assert!(Error::Invalid.is_control_flow());
        assert!(Error::Retransmission.is_control_flow());
        assert!(!Error::Persistence("down".into()).is_control_flow());
        assert!(!Error::CapacityExceeded { aor: "a@b".into() }.is_control_flow());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: boom");
    }
}

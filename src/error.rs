use std::time::Duration;

use thiserror::Error;

use crate::model::TxnId;

/// Why a query could not be embedded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown filter field '{0}'")]
    InvalidFilterField(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("duplicate transaction id {0}")]
    DuplicateId(TxnId),

    #[error("embedding unavailable after {attempts} attempt(s): {cause}")]
    EmbeddingUnavailable { attempts: u32, cause: EmbeddingFailure },

    #[error("record store and vector index are inconsistent: {0}")]
    IndexInconsistent(String),

    #[error("corrupt data file: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to map failures onto exit codes or statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    DimensionMismatch,
    EmbeddingUnavailable,
    IndexInconsistent,
    Storage,
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::InvalidArgument(_)
            | RetrievalError::InvalidFilterField(_)
            | RetrievalError::DuplicateId(_) => ErrorKind::InvalidArgument,
            RetrievalError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            RetrievalError::EmbeddingUnavailable { .. } => ErrorKind::EmbeddingUnavailable,
            RetrievalError::IndexInconsistent(_) => ErrorKind::IndexInconsistent,
            RetrievalError::Corrupt(_) | RetrievalError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Caller errors are surfaced immediately and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidArgument | ErrorKind::DimensionMismatch)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RetrievalError::InvalidArgument(msg.into())
    }

    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        RetrievalError::IndexInconsistent(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_group_caller_errors() {
        assert!(RetrievalError::invalid("top_k").is_caller_error());
        assert!(RetrievalError::InvalidFilterField("merchant".into()).is_caller_error());
        assert!(RetrievalError::DimensionMismatch { expected: 3, got: 2 }.is_caller_error());

        let unavailable = RetrievalError::EmbeddingUnavailable {
            attempts: 3,
            cause: EmbeddingFailure::Timeout(Duration::from_millis(50)),
        };
        assert_eq!(unavailable.kind(), ErrorKind::EmbeddingUnavailable);
        assert!(!unavailable.is_caller_error());
        assert_eq!(
            RetrievalError::inconsistent("count").kind(),
            ErrorKind::IndexInconsistent
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = RetrievalError::DimensionMismatch { expected: 384, got: 128 };
        assert_eq!(err.to_string(), "dimension mismatch: expected 384, got 128");

        let err = RetrievalError::EmbeddingUnavailable {
            attempts: 2,
            cause: EmbeddingFailure::Provider("connection refused".into()),
        };
        assert_eq!(err.to_string(), "embedding unavailable after 2 attempt(s): connection refused");
    }
}

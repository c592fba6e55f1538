//! Queue error taxonomy.
//!
//! Every failure surfaced by the engine is a [`QueueError`]. Callers branch on
//! [`QueueError::kind`] to decide whether to back off (capacity), quarantine
//! (codec) or abort (fatal). Storage driver errors are classified here so the
//! retry coordinator only ever sees `Conflict` as retryable.

use thiserror::Error;

use crate::redis::pool::PoolError;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Lock wait timeout, serialization failure, deadlock or a lost claim race
    #[error("Transient storage conflict: {0}")]
    Conflict(String),

    /// Insert hit an existing identity
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Queue storage reached its capacity bound
    #[error("Queue {queue} is full (capacity: {capacity})")]
    QueueFull { queue: String, capacity: usize },

    /// Ephemeral storage reached its capacity bound
    #[error("Ephemeral storage of queue {queue} is full (capacity: {capacity})")]
    EphemeralFull { queue: String, capacity: usize },

    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored message could not be decoded; the entry is left in place
    #[error("Failed to decode message {id}: {reason}")]
    Deserialization { id: String, reason: String },

    /// Backend lacks the capability
    #[error("Operation {operation} is not supported by the {backend} backend")]
    NotSupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Operation needs an identity the message does not carry
    #[error("Message has no id")]
    MissingId,

    /// Rejected configuration
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    /// Backend is unreachable (connection loss, circuit breaker open)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Any other storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transient conflicts persisted past the retry bound
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<QueueError>,
    },
}

/// Coarse classification of a [`QueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable storage conflict
    Transient,
    /// Identity already present
    Duplicate,
    /// Backpressure signal
    Capacity,
    /// Encoding or decoding failure
    Codec,
    /// Capability gap
    Unsupported,
    /// Everything else
    Fatal,
}

impl QueueError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Transient,
            Self::DuplicateKey(_) => ErrorKind::Duplicate,
            Self::QueueFull { .. } | Self::EphemeralFull { .. } => ErrorKind::Capacity,
            Self::Serialization(_) | Self::Deserialization { .. } => ErrorKind::Codec,
            Self::NotSupported { .. } => ErrorKind::Unsupported,
            Self::MissingId
            | Self::InvalidConfig(_)
            | Self::Unavailable(_)
            | Self::Storage(_)
            | Self::RetriesExhausted { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the retry coordinator may re-run the operation.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether this is a duplicate-key signal.
    pub fn is_duplicate(&self) -> bool {
        self.kind() == ErrorKind::Duplicate
    }
}

/// PostgreSQL SQLSTATE codes treated as transient conflicts.
const PG_TRANSIENT_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (lock_timeout / statement_timeout)
];

/// PostgreSQL SQLSTATE for unique_violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                match code.as_deref() {
                    Some(PG_UNIQUE_VIOLATION) => Self::DuplicateKey(db_err.message().to_string()),
                    Some(c) if PG_TRANSIENT_CODES.contains(&c) => {
                        Self::Conflict(format!("{} (SQLSTATE {})", db_err.message(), c))
                    }
                    _ => Self::Storage(err.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => Self::Unavailable(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            return Self::Unavailable(err.to_string());
        }

        match err.kind() {
            redis::ErrorKind::TryAgain
            | redis::ErrorKind::BusyLoadingError
            | redis::ErrorKind::ExecAbortError => Self::Conflict(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<PoolError> for QueueError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Redis(e) => e.into(),
            PoolError::CircuitOpen => Self::Unavailable("Circuit breaker is open".to_string()),
            PoolError::ConnectionUnavailable(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for QueueError {
    fn from(err: prometheus::Error) -> Self {
        Self::InvalidConfig(format!("metrics: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(QueueError::Conflict("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(QueueError::DuplicateKey("x".into()).kind(), ErrorKind::Duplicate);
        assert_eq!(
            QueueError::QueueFull {
                queue: "q".into(),
                capacity: 1
            }
            .kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            QueueError::EphemeralFull {
                queue: "q".into(),
                capacity: 1
            }
            .kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            QueueError::Deserialization {
                id: "1".into(),
                reason: "bad".into()
            }
            .kind(),
            ErrorKind::Codec
        );
        assert_eq!(
            QueueError::NotSupported {
                operation: "scan_orphans",
                backend: "stream"
            }
            .kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(QueueError::Unavailable("down".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_retries_exhausted_is_not_transient() {
        let err = QueueError::RetriesExhausted {
            operation: "take",
            attempts: 4,
            source: Box::new(QueueError::Conflict("lock timeout".into())),
        };

        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Fatal);
        let text = err.to_string();
        assert!(text.contains("take failed after 4 attempts"));
        assert!(text.contains("lock timeout"));
    }

    #[test]
    fn test_pool_error_mapping() {
        let err: QueueError = PoolError::CircuitOpen.into();
        assert!(matches!(err, QueueError::Unavailable(_)));

        let err: QueueError = PoolError::ConnectionUnavailable("gone".into()).into();
        assert!(matches!(err, QueueError::Unavailable(msg) if msg == "gone"));
    }

    #[test]
    fn test_sqlx_pool_errors_are_unavailable() {
        let err: QueueError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(err, QueueError::Unavailable(_)));

        let err: QueueError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, QueueError::Storage(_)));
    }

    #[test]
    fn test_redis_error_classification() {
        let err: QueueError =
            redis::RedisError::from((redis::ErrorKind::TryAgain, "TRYAGAIN")).into();
        assert!(err.is_transient());

        let err: QueueError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE")).into();
        assert!(matches!(err, QueueError::Storage(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: QueueError = redis::RedisError::from(io).into();
        assert!(matches!(err, QueueError::Unavailable(_)));
    }
}

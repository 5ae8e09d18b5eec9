//! Cache store error types.

use std::fmt;
use std::time::Duration;

/// Errors that can occur during cache store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend cannot be reached.
    #[error("Cache store unavailable: {message}")]
    Unavailable {
        /// Description of the connection failure.
        message: String,
    },

    /// An operation did not complete within its deadline.
    #[error("Cache store operation {operation} timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// An atomic multi-key operation was not applied.
    #[error("Atomic operation aborted: {message}")]
    TransactionAborted {
        /// Why the transaction was not applied.
        message: String,
    },

    /// A key holds a value of the wrong kind for the operation.
    #[error("Wrong value type at key {key}")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// The backend rejected a command.
    #[error("Cache store backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// Creates a new `TransactionAborted` error.
    #[must_use]
    pub fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::TransactionAborted {
            message: message.into(),
        }
    }

    /// Creates a new `WrongType` error.
    #[must_use]
    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns `true` if the store could not be reached in time.
    ///
    /// Callers degrade to the uncached path on these.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if an atomic operation was not applied at all.
    #[must_use]
    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => ErrorCategory::Connectivity,
            Self::TransactionAborted { .. } => ErrorCategory::Transaction,
            Self::WrongType { .. } => ErrorCategory::Data,
            Self::Backend { .. } => ErrorCategory::Backend,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::unavailable(format!("redis timeout: {err}"))
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            Self::unavailable(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            Self::backend(format!("unexpected reply type: {err}"))
        } else {
            Self::backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::unavailable(format!("redis pool: {err}"))
    }
}

/// Categories of cache store errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection and timeout failures.
    Connectivity,
    /// Aborted atomic operations.
    Transaction,
    /// Stored data of an unexpected shape.
    Data,
    /// Other backend failures.
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Transaction => write!(f, "transaction"),
            Self::Data => write!(f, "data"),
            Self::Backend => write!(f, "backend"),
        }
    }
}

/// Result type alias for cache store operations.
pub type StoreResult<T> = Result<T, StoreError>;

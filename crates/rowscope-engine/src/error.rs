//! Cache engine error types.

use std::fmt;
use std::time::Duration;

use rowscope_auth::AuthError;
use rowscope_core::{CoreError, DataSourceId};
use rowscope_store::StoreError;

/// Errors that can occur while serving, warming or invalidating cached
/// analytics results.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Resolution or query scoping failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The cache store failed. `Unavailable`/`Timeout` trigger the slow path.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Payload or hierarchy error from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The warehouse did not answer within its deadline.
    #[error("Warehouse query on {data_source} timed out after {timeout:?}")]
    WarehouseTimeout {
        /// Data source being queried.
        data_source: DataSourceId,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The warehouse rejected or failed the query.
    #[error("Warehouse error: {message}")]
    Warehouse {
        /// Description of the warehouse failure.
        message: String,
    },

    /// The shadow-to-production swap was not applied.
    #[error("Swap failed for {data_source}: {message}")]
    SwapFailed {
        /// Data source whose swap failed.
        data_source: DataSourceId,
        /// Why the swap did not apply.
        message: String,
    },

    /// A dimension key is malformed.
    #[error("Invalid dimension key: {message}")]
    InvalidDimension {
        /// Description of the problem.
        message: String,
    },

    /// A referenced resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource.
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A cache entry could not be decoded.
    #[error("Corrupt cache entry at {key}: {message}")]
    CorruptEntry {
        /// Store key of the entry.
        key: String,
        /// Decoding failure.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl EngineError {
    /// Creates a new `WarehouseTimeout` error.
    #[must_use]
    pub fn warehouse_timeout(data_source: DataSourceId, timeout: Duration) -> Self {
        Self::WarehouseTimeout {
            data_source,
            timeout,
        }
    }

    /// Creates a new `Warehouse` error.
    #[must_use]
    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
        }
    }

    /// Creates a new `SwapFailed` error.
    #[must_use]
    pub fn swap_failed(data_source: DataSourceId, message: impl Into<String>) -> Self {
        Self::SwapFailed {
            data_source,
            message: message.into(),
        }
    }

    /// Creates a new `InvalidDimension` error.
    #[must_use]
    pub fn invalid_dimension(message: impl Into<String>) -> Self {
        Self::InvalidDimension {
            message: message.into(),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Creates a new `CorruptEntry` error.
    #[must_use]
    pub fn corrupt_entry(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptEntry {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the cache store could not be reached.
    #[must_use]
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_unavailable())
    }

    /// Returns `true` for infrastructure failures worth one local retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_store_unavailable() || matches!(self, Self::WarehouseTimeout { .. })
    }

    /// Returns `true` if the caller must see a plain "access denied".
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Auth(e) if e.is_access_denied())
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(e) if e.is_access_denied() => ErrorCategory::Authorization,
            Self::Auth(e) if e.is_hierarchy_corruption() => ErrorCategory::Corruption,
            Self::Auth(e) if e.is_server_error() => ErrorCategory::Internal,
            Self::Auth(_) => ErrorCategory::Validation,
            Self::Store(e) if e.is_unavailable() => ErrorCategory::Infrastructure,
            Self::Store(_) => ErrorCategory::Internal,
            Self::Core(e) if e.is_hierarchy_corruption() => ErrorCategory::Corruption,
            Self::Core(_) => ErrorCategory::Internal,
            Self::WarehouseTimeout { .. } => ErrorCategory::Infrastructure,
            Self::Warehouse { .. } => ErrorCategory::Infrastructure,
            Self::SwapFailed { .. } => ErrorCategory::Transaction,
            Self::InvalidDimension { .. } => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::CorruptEntry { .. } => ErrorCategory::Internal,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of engine errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caller is not allowed to read.
    Authorization,
    /// Corrupt organization data.
    Corruption,
    /// Rejected input.
    Validation,
    /// Cache store or warehouse failures.
    Infrastructure,
    /// Atomic swap failures.
    Transaction,
    /// Unknown job or data source.
    NotFound,
    /// Internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorization => write!(f, "authorization"),
            Self::Corruption => write!(f, "corruption"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Transaction => write!(f, "transaction"),
            Self::NotFound => write!(f, "not_found"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

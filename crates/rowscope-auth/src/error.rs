//! Permission resolution and filter injection error types.

use std::fmt;

use rowscope_core::CoreError;

/// Errors that can occur while resolving a caller's scope or building a
/// scoped query.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Resolution produced deny-all. Not a system fault.
    #[error("Access denied for caller {caller_id}")]
    Denied {
        /// The caller that was denied.
        caller_id: String,
    },

    /// The caller holds a malformed or conflicting analytics grant.
    #[error("Ambiguous grant {grant:?} for caller {caller_id}")]
    AmbiguousGrant {
        /// The caller holding the grant.
        caller_id: String,
        /// The offending grant string.
        grant: String,
    },

    /// The organization hierarchy is corrupt.
    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] CoreError),

    /// A table or column name failed identifier validation.
    #[error("Invalid identifier: {identifier:?}")]
    InvalidIdentifier {
        /// The rejected identifier.
        identifier: String,
    },

    /// A query could not be rendered.
    #[error("Invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },

    /// The identity/role store could not be read.
    #[error("Identity store error: {message}")]
    IdentityStore {
        /// Description of the store failure.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `Denied` error.
    #[must_use]
    pub fn denied(caller_id: impl Into<String>) -> Self {
        Self::Denied {
            caller_id: caller_id.into(),
        }
    }

    /// Creates a new `AmbiguousGrant` error.
    #[must_use]
    pub fn ambiguous_grant(caller_id: impl Into<String>, grant: impl Into<String>) -> Self {
        Self::AmbiguousGrant {
            caller_id: caller_id.into(),
            grant: grant.into(),
        }
    }

    /// Creates a new `InvalidIdentifier` error.
    #[must_use]
    pub fn invalid_identifier(identifier: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            identifier: identifier.into(),
        }
    }

    /// Creates a new `InvalidQuery` error.
    #[must_use]
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates a new `IdentityStore` error.
    #[must_use]
    pub fn identity_store(message: impl Into<String>) -> Self {
        Self::IdentityStore {
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

    /// Returns `true` if the caller must see a plain "access denied".
    ///
    /// Neither variant may leak why access was refused.
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Denied { .. } | Self::AmbiguousGrant { .. })
    }

    /// Returns `true` if the organization hierarchy is corrupt.
    #[must_use]
    pub fn is_hierarchy_corruption(&self) -> bool {
        matches!(self, Self::Hierarchy(e) if e.is_hierarchy_corruption())
    }

    /// Returns `true` if this is an infrastructure or internal failure.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Hierarchy(_) | Self::IdentityStore { .. } | Self::Internal { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Denied { .. } => ErrorCategory::Authorization,
            Self::AmbiguousGrant { .. } => ErrorCategory::Authorization,
            Self::Hierarchy(e) if e.is_hierarchy_corruption() => ErrorCategory::Corruption,
            Self::Hierarchy(_) => ErrorCategory::Infrastructure,
            Self::InvalidIdentifier { .. } => ErrorCategory::Validation,
            Self::InvalidQuery { .. } => ErrorCategory::Validation,
            Self::IdentityStore { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of resolution errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Permission decisions.
    Authorization,
    /// Corrupt organization data.
    Corruption,
    /// Rejected input.
    Validation,
    /// Identity store failures.
    Infrastructure,
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
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowscope_core::OrganizationId;

    #[test]
    fn test_access_denied_classification() {
        assert!(AuthError::denied("u1").is_access_denied());
        assert!(AuthError::ambiguous_grant("u1", "analytics:write").is_access_denied());
        assert!(!AuthError::internal("boom").is_access_denied());
    }

    #[test]
    fn test_hierarchy_errors_are_corruption() {
        let err = AuthError::from(CoreError::hierarchy_cycle(OrganizationId::new(3)));
        assert!(err.is_hierarchy_corruption());
        assert!(err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Corruption);

        let err = AuthError::from(CoreError::source("unreachable"));
        assert!(!err.is_hierarchy_corruption());
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Authorization.to_string(), "authorization");
        assert_eq!(
            AuthError::invalid_identifier("a;b").category().to_string(),
            "validation"
        );
    }
}

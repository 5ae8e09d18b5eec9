use std::fmt;

use thiserror::Error;

use crate::id::OrganizationId;

/// Core error types for rowscope operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Hierarchy cycle detected at organization {organization_id}")]
    HierarchyCycle { organization_id: OrganizationId },

    #[error("Hierarchy below organization {organization_id} exceeds maximum depth {max_depth}")]
    HierarchyTooDeep {
        organization_id: OrganizationId,
        max_depth: usize,
    },

    #[error("Duplicate organization in snapshot: {0}")]
    DuplicateOrganization(OrganizationId),

    #[error("Organization source error: {0}")]
    Source(String),

    #[error("Invalid result set: {message}")]
    InvalidResultSet { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new HierarchyCycle error
    pub fn hierarchy_cycle(organization_id: OrganizationId) -> Self {
        Self::HierarchyCycle { organization_id }
    }

    /// Create a new HierarchyTooDeep error
    pub fn hierarchy_too_deep(organization_id: OrganizationId, max_depth: usize) -> Self {
        Self::HierarchyTooDeep {
            organization_id,
            max_depth,
        }
    }

    /// Create a new Source error
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    /// Create a new InvalidResultSet error
    pub fn invalid_result_set(message: impl Into<String>) -> Self {
        Self::InvalidResultSet {
            message: message.into(),
        }
    }

    /// Check if this error indicates corrupt hierarchy data.
    ///
    /// Corrupt hierarchies are fatal to a resolution and must be logged at
    /// high severity by the caller.
    pub fn is_hierarchy_corruption(&self) -> bool {
        matches!(
            self,
            Self::HierarchyCycle { .. }
                | Self::HierarchyTooDeep { .. }
                | Self::DuplicateOrganization(_)
        )
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HierarchyCycle { .. }
            | Self::HierarchyTooDeep { .. }
            | Self::DuplicateOrganization(_) => ErrorCategory::Corruption,
            Self::Source(_) => ErrorCategory::Infrastructure,
            Self::InvalidResultSet { .. } => ErrorCategory::Validation,
            Self::JsonError(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error categories for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Corruption,
    Infrastructure,
    Validation,
    Serialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corruption => write!(f, "corruption"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Validation => write!(f, "validation"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

//! # rowscope-auth
//!
//! Permission resolution for multi-tenant analytics reads.
//!
//! Converts a caller's organization memberships and analytics grants into a
//! minimal row filter, and merges that filter into warehouse queries. Every
//! ambiguity resolves to deny-all.
//!
//! ## Modules
//!
//! - [`grant`] - closed grant enumeration and derived permission tiers
//! - [`context`] - caller authorization context and stored caller records
//! - [`identity`] - identity/role store trait and an in-process store
//! - [`resolver`] - three-tier permission resolver
//! - [`filter`] - effective filters and in-memory re-filtering
//! - [`injector`] - parameterized predicate injection
//! - [`audit`] - resolution audit signal

pub mod audit;
pub mod context;
pub mod error;
pub mod filter;
pub mod grant;
pub mod identity;
pub mod injector;
pub mod resolver;

pub use audit::{
    AUDIT_TARGET, AuditSink, RecordingAuditSink, ResolutionAudit, ResolutionOutcome,
    TracingAuditSink,
};
pub use context::{CallerContext, CallerRecord};
pub use error::{AuthError, ErrorCategory};
pub use filter::{EffectiveFilter, ScopeColumns};
pub use grant::{AnalyticsGrant, PermissionTier, UnknownGrant, parse_grants};
pub use identity::{IdentityStore, StaticIdentityStore};
pub use injector::{
    AnalyticsQuery, BuiltQuery, CompareOp, FilterInjector, Predicate, SqlValue,
    validate_identifier,
};
pub use resolver::PermissionResolver;

/// Type alias for resolution results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rowscope_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::context::CallerContext;
    pub use crate::error::AuthError;
    pub use crate::filter::{EffectiveFilter, ScopeColumns};
    pub use crate::grant::{AnalyticsGrant, PermissionTier};
    pub use crate::identity::IdentityStore;
    pub use crate::injector::{AnalyticsQuery, FilterInjector, Predicate, SqlValue};
    pub use crate::resolver::PermissionResolver;
}

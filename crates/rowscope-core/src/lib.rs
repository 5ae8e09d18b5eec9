//! # rowscope-core
//!
//! Shared building blocks for the rowscope analytics scoping engine:
//!
//! - [`id`] - typed organization, facility, practitioner and data-source ids
//! - [`organization`] - organization records as read from the identity store
//! - [`hierarchy`] - immutable arena index answering descendant and facility
//!   union queries with cycle and depth guards
//! - [`snapshot`] - lock-free shared hierarchy snapshot with periodic refresh
//! - [`result_set`] - opaque warehouse row collections

pub mod error;
pub mod hierarchy;
pub mod id;
pub mod organization;
pub mod result_set;
pub mod snapshot;

pub use error::{CoreError, ErrorCategory, Result};
pub use hierarchy::{HierarchyIndex, MAX_HIERARCHY_DEPTH};
pub use id::{DataSourceId, FacilityId, InvalidDataSourceId, OrganizationId, PractitionerId};
pub use organization::Organization;
pub use result_set::{ColumnSpec, ColumnType, ResultSet};
pub use snapshot::{HierarchySnapshot, OrganizationSource, SharedHierarchy};

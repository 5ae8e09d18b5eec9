//! Resolution audit signal.
//!
//! Every resolution, successful or not, produces exactly one
//! [`ResolutionAudit`]. The record carries counts only: facility ids and
//! organization ids stay out of the audit stream.

use std::sync::Mutex;

use serde::Serialize;

use crate::grant::PermissionTier;

/// Tracing target for resolution audit events.
pub const AUDIT_TARGET: &str = "rowscope::audit";

/// Final outcome of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Unrestricted,
    Facilities,
    Practitioner,
    DenyAll,
    /// Resolution failed (ambiguous grant, corrupt hierarchy).
    Error,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAudit {
    pub caller_id: String,
    pub tier: PermissionTier,
    pub membership_count: usize,
    pub filter_size: usize,
    pub outcome: ResolutionOutcome,
}

/// Receiver of resolution audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &ResolutionAudit);
}

/// Emits audit records as `info` events under [`AUDIT_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &ResolutionAudit) {
        tracing::info!(
            target: AUDIT_TARGET,
            caller_id = %event.caller_id,
            tier = %event.tier,
            membership_count = event.membership_count,
            filter_size = event.filter_size,
            outcome = ?event.outcome,
            "Permission resolved"
        );
    }
}

/// Keeps every record in memory. Intended for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<ResolutionAudit>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<ResolutionAudit> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &ResolutionAudit) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

//! Deckhand apply: the two deployers.
//!
//! - [`legacy::LegacyInstantiator`] applies namespace bundles kind by kind in
//!   priority order and unwinds already-created objects on failure.
//! - [`release::ReleaseManager`] applies a release's resources concurrently and
//!   records the aggregate outcome on the release row.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use deckhand_core::{AuditEntry, AuditSink, AuditStatus, ReleaseResult};
use tracing::{info, warn};

pub mod legacy;
pub mod registry;
pub mod release;

pub use legacy::{InstantiationRequest, InstantiationResult, LegacyInstantiator, NamespaceBundle, RollbackOutcome};
pub use registry::{ApplyContext, ApplyOp, KindRegistry, RollbackEntry, RollbackOp};
pub use release::{ReleaseData, ReleaseManager, ReleaseRequest};

/// Common shape of both deployers: take a bundle, report an outcome.
#[async_trait]
pub trait Deployer: Send + Sync {
    type Bundle: Send + Sync;
    type Outcome: Send;

    async fn apply(&self, bundle: &Self::Bundle) -> ReleaseResult<Self::Outcome>;
}

/// Writes audit entries to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, entry: AuditEntry) {
        match entry.status {
            AuditStatus::Succeed => info!(
                activity = %entry.activity_type,
                resource_type = %entry.resource_type,
                resource = %entry.resource,
                "{}",
                entry.description
            ),
            AuditStatus::Failed => warn!(
                activity = %entry.activity_type,
                resource_type = %entry.resource_type,
                resource = %entry.resource,
                error = entry.error_message.as_deref().unwrap_or(""),
                "{}",
                entry.description
            ),
        }
    }
}

/// Keeps entries in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }
}

pub(crate) fn audit_entry(activity: &str, resource: &str, description: String, outcome: Result<(), String>) -> AuditEntry {
    let (status, error_message) = match outcome {
        Ok(()) => (AuditStatus::Succeed, None),
        Err(e) => (AuditStatus::Failed, Some(e)),
    };
    AuditEntry {
        activity_type: activity.to_string(),
        resource_type: "release".to_string(),
        resource: resource.to_string(),
        description,
        status,
        error_message,
    }
}

//! Deckhand core types: resource specs, release records, kind ordering and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod config;
pub mod error;
pub mod kinds;
pub mod manifest;
pub mod store;

pub use config::EngineConfig;
pub use error::{ReleaseError, ReleaseResult};

pub mod prelude {
    pub use super::{
        AppRelease, AuditEntry, AuditSink, InstanceRecord, InstanceState, ReleaseStatus, ResourceData,
        ResourceInstance, ResourceKey, ResourceSpec,
    };
    pub use super::error::{ReleaseError, ReleaseResult};
    pub use super::store::{CacheBackend, InstanceStore, ReleaseStore};
}

/// One rendered manifest as produced by a generator, before it reaches the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub manifest: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl ResourceSpec {
    /// Build a spec from a manifest; kind, name and apiVersion are read from the document.
    pub fn from_manifest(manifest: Json, ns_override: Option<&str>) -> ReleaseResult<Self> {
        let key = ResourceKey::from_manifest(&manifest, ns_override)?;
        Ok(Self {
            kind: key.kind,
            name: key.name,
            namespace: key.namespace,
            manifest,
            api_version: key.api_version,
        })
    }

    /// Address of this resource on the cluster. The manifest's own kind wins over the
    /// generator label (legacy bundles label deployments as "application").
    pub fn key(&self) -> ResourceKey {
        let kind = self
            .manifest
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.kind)
            .to_string();
        let api_version = self
            .api_version
            .clone()
            .or_else(|| self.manifest.get("apiVersion").and_then(|v| v.as_str()).map(|s| s.to_string()));
        ResourceKey { kind, api_version, namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

/// Generator output for the release path; carries template version bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceData {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub manifest: Json,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub revision: i64,
}

impl ResourceData {
    pub fn spec(&self) -> ResourceSpec {
        ResourceSpec {
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: Some(self.namespace.clone()),
            manifest: self.manifest.clone(),
            api_version: self.manifest.get("apiVersion").and_then(|v| v.as_str()).map(|s| s.to_string()),
        }
    }
}

/// Address of a single object: Kind, optional explicit apiVersion, namespace and name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub api_version: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self { kind: kind.to_string(), api_version: None, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn with_api_version(mut self, api_version: &str) -> Self {
        self.api_version = Some(api_version.to_string());
        self
    }

    /// Read the address out of a manifest. `ns_override` wins over `metadata.namespace`.
    pub fn from_manifest(manifest: &Json, ns_override: Option<&str>) -> ReleaseResult<Self> {
        manifest::target_of(manifest, ns_override)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Per-resource state of a legacy instantiation attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    InsSuccess,
    InsFailed,
    UpdateSuccess,
    UpdateFailed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::InsSuccess => "ins_success",
            InstanceState::InsFailed => "ins_failed",
            InstanceState::UpdateSuccess => "update_success",
            InstanceState::UpdateFailed => "update_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => InstanceState::Pending,
            "ins_success" => InstanceState::InsSuccess,
            "ins_failed" => InstanceState::InsFailed,
            "update_success" => InstanceState::UpdateSuccess,
            "update_failed" => InstanceState::UpdateFailed,
            _ => return None,
        })
    }

    /// Terminal state for one attempt.
    pub fn settled(is_update: bool, ok: bool) -> Self {
        match (is_update, ok) {
            (false, true) => InstanceState::InsSuccess,
            (false, false) => InstanceState::InsFailed,
            (true, true) => InstanceState::UpdateSuccess,
            (true, false) => InstanceState::UpdateFailed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Deployed,
    Failed,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReleaseStatus::Pending),
            "deployed" => Some(ReleaseStatus::Deployed),
            "failed" => Some(ReleaseStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted release row; unique on (name, cluster_id, namespace).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRelease {
    pub id: i64,
    pub name: String,
    pub cluster_id: String,
    pub namespace: String,
    pub template_id: i64,
    pub status: ReleaseStatus,
    pub message: String,
}

/// Persisted resource row; unique on (app_release_id, kind, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceInstance {
    pub id: i64,
    pub app_release_id: i64,
    pub kind: String,
    pub name: String,
    pub manifest: Json,
    pub version: String,
    pub revision: i64,
    pub edited: bool,
}

/// Row of the legacy `instance_config` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub namespace_id: String,
    pub category: String,
    pub name: String,
    pub instance_id: Option<i64>,
    pub ins_state: InstanceState,
    pub is_bcs_success: bool,
    pub config: Json,
    pub updated: i64,
    pub deleted: bool,
}

/// Summary handed to the audit collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub activity_type: String,
    pub resource_type: String,
    pub resource: String,
    pub description: String,
    pub status: AuditStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Succeed,
    Failed,
}

/// Receiver of success/failure summaries. Implementations must not block for long.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

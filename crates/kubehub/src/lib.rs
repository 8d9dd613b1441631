//! Deckhand kubehub: resource type discovery, discovery caching and a dynamic
//! resource client over arbitrary kinds.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use deckhand_core::manifest::{diff_summary, resource_version, strip_noisy};
use deckhand_core::{ReleaseError, ReleaseResult, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

pub mod client;
pub mod discovery;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod pool;
#[cfg(test)]
mod test_support;

pub use client::DynamicClient;
pub use discovery::{Discoverer, KubeDiscoverer, MemoryCache, ResourceDiscovery, ResourceType, ServedGroupVersion, TypeMap};
#[cfg(any(test, feature = "test-support"))]
pub use mock::MemoryCluster;
pub use pool::{
    ClientCache, ClientFactory, ClientKey, ClusterConnector, ClusterCredentials, CredentialConnector, CredentialResolver,
    CurrentContext, ScopedClients, SingleClient,
};

/// PATCH flavours understood by the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Strategic,
    Merge,
    Json,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::Strategic => "application/strategic-merge-patch+json",
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Json => "application/json-patch+json",
        }
    }

    /// JSON-Patch needs an operation list; a document body is sent as strategic merge instead.
    pub fn effective(self, body: &Json) -> PatchKind {
        match self {
            PatchKind::Json if !body.is_array() => PatchKind::Strategic,
            other => other,
        }
    }
}

/// How `update_or_create` treats an object that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    /// PUT the whole body. With `auto_resource_version` the live resourceVersion is injected.
    Replace { auto_resource_version: bool },
    Patch(PatchKind),
}

impl Default for UpdateMethod {
    fn default() -> Self {
        UpdateMethod::Replace { auto_resource_version: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub object: Json,
    pub created: bool,
}

fn name_selector(name: &str) -> String {
    format!("metadata.name={}", name)
}

/// Generic CRUD over arbitrary kinds. Implementations provide the primitives; the
/// composite operations are shared.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// GET; a missing object is `None`, other failures propagate.
    async fn get_or_none(&self, key: &ResourceKey) -> ReleaseResult<Option<Json>>;

    async fn create(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json>;

    async fn replace(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json>;

    async fn patch(&self, key: &ResourceKey, body: &Json, kind: PatchKind) -> ReleaseResult<Json>;

    /// Raw delete; a missing object is an `ApiStatus` 404.
    async fn delete(&self, key: &ResourceKey) -> ReleaseResult<()>;

    async fn list(
        &self,
        kind: &str,
        api_version: Option<&str>,
        namespace: Option<&str>,
        field_selector: Option<&str>,
    ) -> ReleaseResult<Vec<Json>>;

    async fn delete_ignore_nonexistent(&self, key: &ResourceKey) -> ReleaseResult<()> {
        match self.delete(key).await {
            Err(e) if e.is_not_found() => {
                debug!(target = %key, "delete: object already absent");
                Ok(())
            }
            other => other,
        }
    }

    /// Create when absent, otherwise replace or patch.
    async fn update_or_create(&self, body: &Json, namespace: Option<&str>, method: UpdateMethod) -> ReleaseResult<ApplyOutcome> {
        let key = ResourceKey::from_manifest(body, namespace)?;
        let ns = key.namespace.as_deref();
        let Some(live) = self.get_or_none(&key).await? else {
            let object = self.create(body, ns).await?;
            return Ok(ApplyOutcome { object, created: true });
        };
        let diff = diff_summary(&strip_noisy(body.clone()), &strip_noisy(live.clone()));
        debug!(target = %key, adds = diff.adds, updates = diff.updates, removes = diff.removes, "updating existing object");
        let object = match method {
            UpdateMethod::Replace { auto_resource_version } => {
                let mut body = body.clone();
                if auto_resource_version {
                    if let (Some(rv), Some(meta)) = (resource_version(&live), body.get_mut("metadata").and_then(|m| m.as_object_mut())) {
                        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
                    }
                }
                self.replace(&body, ns).await?
            }
            UpdateMethod::Patch(kind) => {
                let kind = kind.effective(body);
                // Merge-style patches cannot remove anything, so a no-op diff is exact.
                if kind != PatchKind::Json && diff.is_noop() {
                    return Ok(ApplyOutcome { object: live, created: false });
                }
                self.patch(&key, body, kind).await?
            }
        };
        Ok(ApplyOutcome { object, created: false })
    }

    /// Delete (ignoring absence) and poll until the object is gone or `max_wait` elapses.
    async fn delete_wait_finished(&self, key: &ResourceKey, max_wait: Duration, poll: Duration) -> ReleaseResult<()> {
        self.delete_ignore_nonexistent(key).await?;
        let started = tokio::time::Instant::now();
        let deadline = started + max_wait;
        let selector = name_selector(&key.name);
        loop {
            let remaining = self
                .list(&key.kind, key.api_version.as_deref(), key.namespace.as_deref(), Some(&selector))
                .await?;
            if remaining.is_empty() {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(target = %key, waited_ms = started.elapsed().as_millis() as u64, "delete did not finish in time");
                return Err(ReleaseError::WaitTimeout { target: key.to_string(), waited: started.elapsed() });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

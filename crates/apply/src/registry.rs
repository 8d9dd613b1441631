//! Per-kind apply/update/rollback operations for the ordered instantiator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deckhand_core::{kinds, ReleaseError, ReleaseResult, ResourceKey, ResourceSpec};
use deckhand_kubehub::{ClientFactory, UpdateMethod};
use serde_json::Value as Json;
use tracing::debug;

/// What an operation needs to know about the namespace it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyContext {
    pub ns_id: String,
    pub cluster_id: String,
    pub namespace: String,
}

/// A successfully applied, non-terminal resource that rollback may undo.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEntry {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub cluster_id: String,
    pub manifest: Json,
}

impl RollbackEntry {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::from_manifest(&self.manifest, Some(&self.namespace))
            .unwrap_or_else(|_| ResourceKey::new(&self.kind, Some(&self.namespace), &self.name))
    }
}

#[async_trait]
pub trait ApplyOp: Send + Sync {
    async fn apply(&self, ctx: &ApplyContext, spec: &ResourceSpec) -> ReleaseResult<()>;
}

#[async_trait]
pub trait RollbackOp: Send + Sync {
    async fn rollback(&self, entry: &RollbackEntry) -> ReleaseResult<()>;
}

#[derive(Default, Clone)]
struct KindOps {
    apply: Option<Arc<dyn ApplyOp>>,
    update: Option<Arc<dyn ApplyOp>>,
    rollback: Option<Arc<dyn RollbackOp>>,
}

/// Lookup table keyed by normalized kind name.
#[derive(Default, Clone)]
pub struct KindRegistry {
    ops: HashMap<String, KindOps>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tabled kind gets create / replace-or-create / delete backed by `clients`.
    pub fn with_defaults(clients: Arc<dyn ClientFactory>) -> Self {
        let mut reg = Self::new();
        let create: Arc<dyn ApplyOp> = Arc::new(CreateOp { clients: clients.clone() });
        let update: Arc<dyn ApplyOp> = Arc::new(ReplaceOp { clients: clients.clone() });
        let delete: Arc<dyn RollbackOp> = Arc::new(DeleteOp { clients });
        for kind in kinds::tabled_kinds() {
            reg.register_apply(kind, create.clone());
            reg.register_update(kind, update.clone());
            reg.register_rollback(kind, delete.clone());
        }
        reg
    }

    fn entry(&mut self, kind: &str) -> &mut KindOps {
        self.ops.entry(kinds::normalize(kind)).or_default()
    }

    pub fn register_apply(&mut self, kind: &str, op: Arc<dyn ApplyOp>) -> &mut Self {
        self.entry(kind).apply = Some(op);
        self
    }

    pub fn register_update(&mut self, kind: &str, op: Arc<dyn ApplyOp>) -> &mut Self {
        self.entry(kind).update = Some(op);
        self
    }

    pub fn register_rollback(&mut self, kind: &str, op: Arc<dyn RollbackOp>) -> &mut Self {
        self.entry(kind).rollback = Some(op);
        self
    }

    /// Drop the rollback operation for a kind.
    pub fn unregister_rollback(&mut self, kind: &str) -> &mut Self {
        self.entry(kind).rollback = None;
        self
    }

    pub fn apply_op(&self, kind: &str) -> ReleaseResult<Arc<dyn ApplyOp>> {
        self.ops
            .get(&kinds::normalize(kind))
            .and_then(|o| o.apply.clone())
            .ok_or_else(|| ReleaseError::UnsupportedKind(kind.to_string()))
    }

    pub fn update_op(&self, kind: &str) -> ReleaseResult<Arc<dyn ApplyOp>> {
        self.ops
            .get(&kinds::normalize(kind))
            .and_then(|o| o.update.clone())
            .ok_or_else(|| ReleaseError::UnsupportedKind(kind.to_string()))
    }

    /// Missing rollback is not an error here; the instantiator logs and skips it.
    pub fn rollback_op(&self, kind: &str) -> Option<Arc<dyn RollbackOp>> {
        self.ops.get(&kinds::normalize(kind)).and_then(|o| o.rollback.clone())
    }
}

fn target_namespace<'a>(ctx: &'a ApplyContext, spec: &'a ResourceSpec) -> &'a str {
    spec.namespace.as_deref().unwrap_or(&ctx.namespace)
}

struct CreateOp {
    clients: Arc<dyn ClientFactory>,
}

#[async_trait]
impl ApplyOp for CreateOp {
    async fn apply(&self, ctx: &ApplyContext, spec: &ResourceSpec) -> ReleaseResult<()> {
        let client = self.clients.client(&ctx.cluster_id).await?;
        client.create(&spec.manifest, Some(target_namespace(ctx, spec))).await?;
        debug!(ns_id = %ctx.ns_id, target = %spec.key(), "created");
        Ok(())
    }
}

struct ReplaceOp {
    clients: Arc<dyn ClientFactory>,
}

#[async_trait]
impl ApplyOp for ReplaceOp {
    async fn apply(&self, ctx: &ApplyContext, spec: &ResourceSpec) -> ReleaseResult<()> {
        let client = self.clients.client(&ctx.cluster_id).await?;
        let out = client
            .update_or_create(&spec.manifest, Some(target_namespace(ctx, spec)), UpdateMethod::Replace { auto_resource_version: true })
            .await?;
        debug!(ns_id = %ctx.ns_id, target = %spec.key(), created = out.created, "updated");
        Ok(())
    }
}

struct DeleteOp {
    clients: Arc<dyn ClientFactory>,
}

#[async_trait]
impl RollbackOp for DeleteOp {
    async fn rollback(&self, entry: &RollbackEntry) -> ReleaseResult<()> {
        let client = self.clients.client(&entry.cluster_id).await?;
        client.delete_ignore_nonexistent(&entry.key()).await
    }
}

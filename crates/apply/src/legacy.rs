//! Ordered instantiator: kind-priority application with a rollback stack.
//!
//! Each namespace runs INIT -> APPLYING(kind..) -> DONE_SUCCESS, or
//! -> ROLLING_BACK -> DONE_FAILED on the first failing resource. Only
//! create attempts unwind; update attempts leave the cluster as it is.

use std::sync::Arc;

use async_trait::async_trait;
use deckhand_core::manifest::{parse_specs, ParseLimits};
use deckhand_core::store::InstanceStore;
use deckhand_core::{kinds, now_ts, InstanceRecord, InstanceState, ReleaseError, ReleaseResult, ResourceSpec};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::registry::{ApplyContext, KindRegistry, RollbackEntry};
use crate::Deployer;

/// One namespace's resources grouped by kind label, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceBundle {
    pub ns_id: String,
    pub cluster_id: String,
    pub namespace: String,
    kinds: Vec<(String, Vec<ResourceSpec>)>,
}

impl NamespaceBundle {
    pub fn new(ns_id: &str, cluster_id: &str, namespace: &str) -> Self {
        Self { ns_id: ns_id.to_string(), cluster_id: cluster_id.to_string(), namespace: namespace.to_string(), kinds: Vec::new() }
    }

    /// Add a resource under a kind label ("secret", "application", ...).
    pub fn push(&mut self, kind: &str, spec: ResourceSpec) -> &mut Self {
        let label = kinds::normalize(kind);
        match self.kinds.iter_mut().find(|(k, _)| *k == label) {
            Some((_, specs)) => specs.push(spec),
            None => self.kinds.push((label, vec![spec])),
        }
        self
    }

    pub fn with(mut self, kind: &str, spec: ResourceSpec) -> Self {
        self.push(kind, spec);
        self
    }

    /// Group rendered manifests by their own kind.
    pub fn from_yaml(ns_id: &str, cluster_id: &str, namespace: &str, yaml: &str, limits: ParseLimits) -> ReleaseResult<Self> {
        let mut bundle = Self::new(ns_id, cluster_id, namespace);
        for spec in parse_specs(yaml, Some(namespace), limits)? {
            let kind = spec.kind.clone();
            bundle.push(&kind, spec);
        }
        Ok(bundle)
    }

    /// Kind groups sorted by priority; ties keep insertion order.
    pub fn ordered(&self) -> Vec<(&str, &[ResourceSpec])> {
        let mut out: Vec<(&str, &[ResourceSpec])> = self.kinds.iter().map(|(k, v)| (k.as_str(), v.as_slice())).collect();
        kinds::sort_by_priority(&mut out, |(k, _)| *k);
        out
    }

    pub fn len(&self) -> usize {
        self.kinds.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstantiationRequest {
    pub bundles: Vec<NamespaceBundle>,
    pub is_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSuccess {
    pub ns_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceFailure {
    pub ns_id: String,
    pub res_type: String,
    pub err_msg: String,
    /// The message came from a validation failure and is safe to show as is.
    #[serde(skip)]
    pub show_verbatim: bool,
    #[serde(skip)]
    pub rollback: Vec<RollbackOutcome>,
}

/// Result of undoing one rollback-stack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub kind: String,
    pub name: String,
    pub attempted: bool,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstantiationResult {
    pub success: Vec<NamespaceSuccess>,
    pub failed: Vec<NamespaceFailure>,
}

impl InstantiationResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct LegacyInstantiator {
    registry: KindRegistry,
    store: Arc<dyn InstanceStore>,
}

impl LegacyInstantiator {
    pub fn new(registry: KindRegistry, store: Arc<dyn InstanceStore>) -> Self {
        Self { registry, store }
    }

    /// Namespaces run one after another; a failed namespace does not stop the rest.
    pub async fn instantiate(&self, req: &InstantiationRequest) -> InstantiationResult {
        let mut result = InstantiationResult::default();
        for bundle in &req.bundles {
            let t0 = std::time::Instant::now();
            match self.instantiate_namespace(bundle, req.is_update).await {
                Ok(()) => {
                    info!(ns_id = %bundle.ns_id, resources = bundle.len(), update = req.is_update, "namespace instantiated");
                    result.success.push(NamespaceSuccess { ns_id: bundle.ns_id.clone() });
                }
                Err(failure) => result.failed.push(failure),
            }
            histogram!("instantiate_namespace_ms", t0.elapsed().as_secs_f64() * 1000.0);
        }
        result
    }

    async fn instantiate_namespace(&self, bundle: &NamespaceBundle, is_update: bool) -> Result<(), NamespaceFailure> {
        let ctx = ApplyContext { ns_id: bundle.ns_id.clone(), cluster_id: bundle.cluster_id.clone(), namespace: bundle.namespace.clone() };
        let ordered = bundle.ordered();
        for (kind, specs) in &ordered {
            for spec in specs.iter() {
                self.persist(bundle, kind, spec, InstanceState::Pending, false);
            }
        }

        let mut stack: Vec<RollbackEntry> = Vec::new();
        for (kind, specs) in ordered {
            debug!(ns_id = %bundle.ns_id, kind, count = specs.len(), "applying kind");
            let op = if is_update { self.registry.update_op(kind) } else { self.registry.apply_op(kind) };
            let op = match op {
                Ok(op) => op,
                Err(e) => return Err(self.fail(bundle, kind, e, stack, is_update).await),
            };
            for spec in specs {
                counter!("apply_attempts", 1u64);
                let res = op.apply(&ctx, spec).await;
                self.persist(bundle, kind, spec, InstanceState::settled(is_update, res.is_ok()), false);
                match res {
                    Ok(()) => {
                        counter!("apply_ok", 1u64);
                        if !is_update && !kinds::is_terminal(kind) {
                            stack.push(RollbackEntry {
                                kind: kind.to_string(),
                                name: spec.name.clone(),
                                namespace: spec.namespace.clone().unwrap_or_else(|| bundle.namespace.clone()),
                                cluster_id: bundle.cluster_id.clone(),
                                manifest: spec.manifest.clone(),
                            });
                        }
                    }
                    Err(e) => {
                        counter!("apply_err", 1u64);
                        return Err(self.fail(bundle, kind, e, stack, is_update).await);
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        bundle: &NamespaceBundle,
        kind: &str,
        err: ReleaseError,
        stack: Vec<RollbackEntry>,
        is_update: bool,
    ) -> NamespaceFailure {
        let show_verbatim = err.is_validation();
        if show_verbatim {
            warn!(ns_id = %bundle.ns_id, kind, error = %err, "manifest rejected");
        } else {
            error!(ns_id = %bundle.ns_id, kind, error = %err, "apply failed");
        }
        let rollback = if is_update { Vec::new() } else { self.unwind(bundle, stack).await };
        NamespaceFailure {
            ns_id: bundle.ns_id.clone(),
            res_type: kind.to_string(),
            err_msg: err.user_message(),
            show_verbatim,
            rollback,
        }
    }

    /// Most recent first. Never stops early.
    async fn unwind(&self, bundle: &NamespaceBundle, mut stack: Vec<RollbackEntry>) -> Vec<RollbackOutcome> {
        let mut outcomes = Vec::with_capacity(stack.len());
        if !stack.is_empty() {
            info!(ns_id = %bundle.ns_id, entries = stack.len(), "rolling back");
        }
        while let Some(entry) = stack.pop() {
            counter!("rollback_total", 1u64);
            let Some(op) = self.registry.rollback_op(&entry.kind) else {
                let e = ReleaseError::Rollback(entry.kind.clone());
                warn!(ns_id = %bundle.ns_id, name = %entry.name, error = %e, "skipping rollback entry");
                outcomes.push(RollbackOutcome {
                    kind: entry.kind,
                    name: entry.name,
                    attempted: false,
                    succeeded: false,
                    error: Some(e.to_string()),
                });
                continue;
            };
            let outcome = match op.rollback(&entry).await {
                Ok(()) => {
                    debug!(ns_id = %bundle.ns_id, target = %entry.key(), "rolled back");
                    let spec = ResourceSpec {
                        kind: entry.kind.clone(),
                        name: entry.name.clone(),
                        namespace: Some(entry.namespace.clone()),
                        manifest: entry.manifest.clone(),
                        api_version: None,
                    };
                    self.persist(bundle, &entry.kind, &spec, InstanceState::InsSuccess, true);
                    RollbackOutcome { kind: entry.kind, name: entry.name, attempted: true, succeeded: true, error: None }
                }
                Err(e) => {
                    warn!(ns_id = %bundle.ns_id, target = %entry.key(), error = %e, "rollback failed");
                    RollbackOutcome { kind: entry.kind, name: entry.name, attempted: true, succeeded: false, error: Some(e.to_string()) }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Store failures are logged; they never change the apply outcome.
    fn persist(&self, bundle: &NamespaceBundle, kind: &str, spec: &ResourceSpec, state: InstanceState, deleted: bool) {
        let rec = InstanceRecord {
            namespace_id: bundle.ns_id.clone(),
            category: kind.to_string(),
            name: spec.name.clone(),
            instance_id: None,
            ins_state: state,
            is_bcs_success: matches!(state, InstanceState::InsSuccess | InstanceState::UpdateSuccess),
            config: spec.manifest.clone(),
            updated: now_ts(),
            deleted,
        };
        if let Err(e) = self.store.upsert_instance(&rec) {
            counter!("instance_persist_errors_total", 1u64);
            error!(ns_id = %bundle.ns_id, kind, name = %spec.name, error = %format!("{:#}", e), "persisting instance state failed");
        }
    }
}

#[async_trait]
impl Deployer for LegacyInstantiator {
    type Bundle = InstantiationRequest;
    type Outcome = InstantiationResult;

    async fn apply(&self, bundle: &InstantiationRequest) -> ReleaseResult<InstantiationResult> {
        Ok(self.instantiate(bundle).await)
    }
}

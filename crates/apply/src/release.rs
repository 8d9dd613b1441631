//! Concurrent release manager.
//!
//! Resources of a release are applied as a bounded fan-out with no ordering
//! and no rollback; the release row records whether every one succeeded.
//! Failures resolve into the persisted status rather than an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deckhand_core::store::ReleaseStore;
use deckhand_core::{
    AppRelease, AuditSink, EngineConfig, ReleaseError, ReleaseResult, ReleaseStatus, ResourceData, ResourceInstance, ResourceKey,
};
use deckhand_kubehub::{ClientFactory, ResourceClient, UpdateMethod};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use crate::{audit_entry, Deployer};

/// A rendered release as handed over by the template layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseData {
    pub name: String,
    pub cluster_id: String,
    pub namespace: String,
    pub template_id: i64,
    pub resource_list: Vec<ResourceData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub operator: String,
    pub release: ReleaseData,
}

const REPLACE: UpdateMethod = UpdateMethod::Replace { auto_resource_version: true };

pub struct ReleaseManager {
    clients: Arc<dyn ClientFactory>,
    store: Arc<dyn ReleaseStore>,
    audit: Arc<dyn AuditSink>,
    fanout: usize,
    /// When set, deletes poll until objects are gone: (max wait, poll interval).
    delete_wait: Option<(Duration, Duration)>,
}

fn instance_key(res: &ResourceInstance, namespace: &str) -> ResourceKey {
    ResourceKey::from_manifest(&res.manifest, Some(namespace)).unwrap_or_else(|_| ResourceKey::new(&res.kind, Some(namespace), &res.name))
}

impl ReleaseManager {
    pub fn new(clients: Arc<dyn ClientFactory>, store: Arc<dyn ReleaseStore>, audit: Arc<dyn AuditSink>, config: &EngineConfig) -> Self {
        Self { clients, store, audit, fanout: config.fanout.max(1), delete_wait: None }
    }

    pub fn with_delete_wait(mut self, max_wait: Duration, poll: Duration) -> Self {
        self.delete_wait = Some((max_wait, poll));
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Upsert the release and apply every resource. Apply and bookkeeping failures
    /// end up in the release status; only a release row that cannot be written at
    /// all is returned as an error.
    pub async fn update_or_create(&self, operator: &str, release: &ReleaseData) -> ReleaseResult<AppRelease> {
        let t0 = std::time::Instant::now();
        let existed = self.store.find_release(&release.name, &release.cluster_id, &release.namespace)?.is_some();
        let activity = if existed { "update" } else { "create" };
        let row = self.store.upsert_release(&release.name, &release.cluster_id, &release.namespace, release.template_id)?;

        let first_err = match self.record_resources(row.id, release) {
            // untracked objects would be invisible to delete, so nothing is applied
            Some(e) => Some(e),
            None => match self.clients.client(&release.cluster_id).await {
                Ok(client) => self.apply_all(client, release).await,
                Err(e) => Some(e),
            },
        };
        let (status, message) = match &first_err {
            None => (ReleaseStatus::Deployed, String::new()),
            Some(e) => (ReleaseStatus::Failed, e.to_string()),
        };
        if let Err(e) = self.store.set_release_status(row.id, status, &message) {
            counter!("release_persist_errors_total", 1u64);
            error!(release = %release.name, status = status.as_str(), error = %e, "release status not persisted");
        }
        histogram!("release_deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            release = %release.name,
            cluster = %release.cluster_id,
            namespace = %release.namespace,
            operator,
            resources = release.resource_list.len(),
            status = status.as_str(),
            "release applied"
        );
        self.audit.record(audit_entry(
            activity,
            &release.name,
            format!("{} release {} in {}/{} by {}", activity, release.name, release.cluster_id, release.namespace, operator),
            first_err.as_ref().map_or(Ok(()), |e| Err(e.user_message())),
        ));
        Ok(AppRelease { status, message, ..row })
    }

    fn record_resources(&self, app_release_id: i64, release: &ReleaseData) -> Option<ReleaseError> {
        for r in &release.resource_list {
            if let Err(e) = self.store.upsert_resource(app_release_id, &r.kind, &r.name, &r.manifest, &r.version, r.revision) {
                counter!("release_persist_errors_total", 1u64);
                error!(release = %release.name, kind = %r.kind, name = %r.name, error = %e, "resource row not persisted");
                return Some(e.into());
            }
        }
        None
    }

    /// Every resource runs to completion; the first failure to finish is reported.
    async fn apply_all(&self, client: Arc<dyn ResourceClient>, release: &ReleaseData) -> Option<ReleaseError> {
        let tasks: Vec<_> = release
            .resource_list
            .iter()
            .map(|r| {
                let client = client.clone();
                let namespace = if r.namespace.is_empty() { release.namespace.clone() } else { r.namespace.clone() };
                async move {
                    counter!("apply_attempts", 1u64);
                    let res = client.update_or_create(&r.manifest, Some(namespace.as_str()), REPLACE).await;
                    (r, res)
                }
            })
            .collect();
        let mut results = stream::iter(tasks).buffer_unordered(self.fanout);

        let mut first_err = None;
        while let Some((r, res)) = results.next().await {
            match res {
                Ok(out) => {
                    counter!("apply_ok", 1u64);
                    debug!(release = %release.name, kind = %r.kind, name = %r.name, created = out.created, "resource applied");
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    warn!(release = %release.name, kind = %r.kind, name = %r.name, error = %e, "resource apply failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err
    }

    /// Delete every tracked object, then the release row. Safe to retry after a
    /// partial failure: already-deleted objects and rows are skipped.
    pub async fn delete(&self, operator: &str, app_release_id: i64) -> ReleaseResult<()> {
        let row = self
            .store
            .get_release(app_release_id)?
            .ok_or_else(|| ReleaseError::Store(format!("release {} not found", app_release_id)))?;
        let outcome = self.delete_resources(&row).await;
        let outcome = match outcome {
            Ok(()) => self.store.delete_release(row.id).map_err(ReleaseError::from),
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(()) => info!(release = %row.name, cluster = %row.cluster_id, operator, "release deleted"),
            Err(e) => warn!(release = %row.name, cluster = %row.cluster_id, operator, error = %e, "release delete incomplete"),
        }
        self.audit.record(audit_entry(
            "delete",
            &row.name,
            format!("delete release {} in {}/{} by {}", row.name, row.cluster_id, row.namespace, operator),
            outcome.as_ref().map_err(|e| e.user_message()).map(|_| ()),
        ));
        outcome
    }

    async fn delete_resources(&self, row: &AppRelease) -> ReleaseResult<()> {
        let resources = self.store.list_resources(row.id)?;
        if resources.is_empty() {
            return Ok(());
        }
        let client = self.clients.client(&row.cluster_id).await?;
        let tasks: Vec<_> = resources
            .into_iter()
            .map(|res| {
                let client = client.clone();
                let store = self.store.clone();
                let key = instance_key(&res, &row.namespace);
                let wait = self.delete_wait;
                async move {
                    match wait {
                        Some((max_wait, poll)) => client.delete_wait_finished(&key, max_wait, poll).await?,
                        None => client.delete_ignore_nonexistent(&key).await?,
                    }
                    store.delete_resource(res.id)?;
                    debug!(target = %key, "resource deleted");
                    Ok::<(), ReleaseError>(())
                }
            })
            .collect();
        let mut results = stream::iter(tasks).buffer_unordered(self.fanout);

        let mut first_err = None;
        while let Some(res) = results.next().await {
            if let Err(e) = res {
                warn!(release = %row.name, error = %e, "resource delete failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Replace one live object out of band and mark the stored row as edited.
    pub async fn edit(&self, operator: &str, resource_instance_id: i64, manifest: Json) -> ReleaseResult<ResourceInstance> {
        let res = self
            .store
            .get_resource(resource_instance_id)?
            .ok_or_else(|| ReleaseError::Store(format!("resource instance {} not found", resource_instance_id)))?;
        let row = self
            .store
            .get_release(res.app_release_id)?
            .ok_or_else(|| ReleaseError::Store(format!("release {} not found", res.app_release_id)))?;

        let outcome = self.edit_live(&row, &res, &manifest).await;
        self.audit.record(audit_entry(
            "edit",
            &row.name,
            format!("edit {} {} of release {} by {}", res.kind, res.name, row.name, operator),
            outcome.as_ref().map_err(|e| e.user_message()).map(|_| ()),
        ));
        outcome?;
        self.store.mark_edited(res.id, &manifest)?;
        info!(release = %row.name, kind = %res.kind, name = %res.name, operator, "resource edited");
        Ok(ResourceInstance { manifest, edited: true, ..res })
    }

    async fn edit_live(&self, row: &AppRelease, res: &ResourceInstance, manifest: &Json) -> ReleaseResult<()> {
        let key = ResourceKey::from_manifest(manifest, Some(&row.namespace))?;
        if !key.kind.eq_ignore_ascii_case(&res.kind) || key.name != res.name {
            return Err(ReleaseError::ConfigValidation(format!(
                "manifest targets {}/{} but resource instance {} is {}/{}",
                key.kind, key.name, res.id, res.kind, res.name
            )));
        }
        let client = self.clients.client(&row.cluster_id).await?;
        client.update_or_create(manifest, Some(&row.namespace), REPLACE).await?;
        Ok(())
    }

    pub fn get(&self, name: &str, cluster_id: &str, namespace: &str) -> ReleaseResult<Option<AppRelease>> {
        Ok(self.store.find_release(name, cluster_id, namespace)?)
    }

    pub fn list(&self, cluster_id: &str, namespace: Option<&str>) -> ReleaseResult<Vec<AppRelease>> {
        Ok(self.store.list_releases(cluster_id, namespace)?)
    }

    pub fn resources(&self, app_release_id: i64) -> ReleaseResult<Vec<ResourceInstance>> {
        Ok(self.store.list_resources(app_release_id)?)
    }
}

#[async_trait]
impl Deployer for ReleaseManager {
    type Bundle = ReleaseRequest;
    type Outcome = AppRelease;

    async fn apply(&self, bundle: &ReleaseRequest) -> ReleaseResult<AppRelease> {
        self.update_or_create(&bundle.operator, &bundle.release).await
    }
}

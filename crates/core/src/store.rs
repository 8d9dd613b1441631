//! Persistence seams. Implementations live in `deckhand-persist`; calls are synchronous.

use anyhow::Result;

use crate::{AppRelease, InstanceRecord, ReleaseStatus, ResourceInstance};

/// Key/value backend for the discovery cache.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// `instance_config` rows written by the ordered instantiator.
pub trait InstanceStore: Send + Sync {
    /// Insert or update keyed by (namespace_id, category, name).
    fn upsert_instance(&self, rec: &InstanceRecord) -> Result<()>;
    fn list_instances(&self, namespace_id: &str) -> Result<Vec<InstanceRecord>>;
}

/// Release bookkeeping for the concurrent release manager.
pub trait ReleaseStore: Send + Sync {
    /// Insert or refresh the row keyed by (name, cluster_id, namespace); status resets to pending.
    fn upsert_release(&self, name: &str, cluster_id: &str, namespace: &str, template_id: i64) -> Result<AppRelease>;
    fn set_release_status(&self, id: i64, status: ReleaseStatus, message: &str) -> Result<()>;
    fn get_release(&self, id: i64) -> Result<Option<AppRelease>>;
    fn find_release(&self, name: &str, cluster_id: &str, namespace: &str) -> Result<Option<AppRelease>>;
    fn list_releases(&self, cluster_id: &str, namespace: Option<&str>) -> Result<Vec<AppRelease>>;
    fn delete_release(&self, id: i64) -> Result<()>;

    /// Insert or update keyed by (app_release_id, kind, name); clears `edited`.
    fn upsert_resource(
        &self,
        app_release_id: i64,
        kind: &str,
        name: &str,
        manifest: &serde_json::Value,
        version: &str,
        revision: i64,
    ) -> Result<ResourceInstance>;
    fn get_resource(&self, id: i64) -> Result<Option<ResourceInstance>>;
    fn list_resources(&self, app_release_id: i64) -> Result<Vec<ResourceInstance>>;
    fn mark_edited(&self, id: i64, manifest: &serde_json::Value) -> Result<()>;
    fn delete_resource(&self, id: i64) -> Result<()>;
}

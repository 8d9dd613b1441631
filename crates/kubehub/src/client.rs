//! Dynamic resource client: CRUD over any kind resolved through discovery.

use std::sync::Arc;

use async_trait::async_trait;
use deckhand_core::store::CacheBackend;
use deckhand_core::{ReleaseError, ReleaseResult, ResourceKey};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::{Client, Resource};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

use crate::discovery::{KubeDiscoverer, ResourceDiscovery, ResourceType};
use crate::{PatchKind, ResourceClient};

/// 404 and every other non-2xx become `ApiStatus`; anything else failed in transit.
pub(crate) fn map_kube_err(e: kube::Error) -> ReleaseError {
    match e {
        kube::Error::Api(ae) => ReleaseError::ApiStatus { code: ae.code, message: ae.message },
        other => ReleaseError::Transport(other.to_string()),
    }
}

fn to_json(obj: &DynamicObject) -> ReleaseResult<Json> {
    serde_json::to_value(obj).map_err(|e| ReleaseError::Internal(format!("serializing {}: {}", obj.metadata.name.as_deref().unwrap_or("object"), e)))
}

pub struct DynamicClient {
    client: Client,
    discovery: ResourceDiscovery,
}

impl DynamicClient {
    pub fn new(client: Client, discovery: ResourceDiscovery) -> Self {
        Self { client, discovery }
    }

    /// Build a client for `cluster_id`, warming discovery from `cache`.
    pub async fn connect(client: Client, cluster_id: &str, cache: Arc<dyn CacheBackend>) -> ReleaseResult<Self> {
        let source = Arc::new(KubeDiscoverer::new(client.clone()));
        let discovery = ResourceDiscovery::load(cluster_id, cache, source).await?;
        Ok(Self::new(client, discovery))
    }

    pub fn discovery(&self) -> &ResourceDiscovery {
        &self.discovery
    }

    async fn api(&self, kind: &str, api_version: Option<&str>, namespace: Option<&str>) -> ReleaseResult<(Api<DynamicObject>, ResourceType)> {
        let rt = self.discovery.get_preferred_resource(kind, api_version).await?;
        let ar = rt.api_resource();
        let api = match (rt.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => {
                return Err(ReleaseError::ConfigValidation(format!("namespace required for namespaced kind {}", rt.kind)))
            }
            (false, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, rt))
    }

    async fn api_for_body(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<(Api<DynamicObject>, DynamicObject, ResourceKey)> {
        let key = ResourceKey::from_manifest(body, namespace)?;
        let (api, _) = self.api(&key.kind, key.api_version.as_deref(), key.namespace.as_deref()).await?;
        let obj: DynamicObject = serde_json::from_value(body.clone())?;
        Ok((api, obj, key))
    }

    /// JSON-Patch goes out as a raw request with its own content type.
    async fn json_patch(&self, key: &ResourceKey, rt: &ResourceType, body: &Json) -> ReleaseResult<DynamicObject> {
        let ns = if rt.namespaced { key.namespace.as_deref() } else { None };
        let url = format!("{}/{}", DynamicObject::url_path(&rt.api_resource(), ns), key.name);
        let payload = serde_json::to_vec(body).map_err(|e| ReleaseError::Internal(e.to_string()))?;
        let req = http::Request::patch(url)
            .header(http::header::CONTENT_TYPE, PatchKind::Json.content_type())
            .body(payload)
            .map_err(|e| ReleaseError::Internal(format!("building patch request: {}", e)))?;
        self.client.request::<DynamicObject>(req).await.map_err(map_kube_err)
    }
}

#[async_trait]
impl ResourceClient for DynamicClient {
    async fn get_or_none(&self, key: &ResourceKey) -> ReleaseResult<Option<Json>> {
        let (api, _) = self.api(&key.kind, key.api_version.as_deref(), key.namespace.as_deref()).await?;
        match api.get_opt(&key.name).await.map_err(map_kube_err)? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json> {
        let t0 = std::time::Instant::now();
        let (api, obj, key) = self.api_for_body(body, namespace).await?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(|e| {
            counter!("apply_err", 1u64);
            map_kube_err(e)
        })?;
        histogram!("client_write_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(target = %key, "created");
        to_json(&created)
    }

    async fn replace(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json> {
        let t0 = std::time::Instant::now();
        let (api, obj, key) = self.api_for_body(body, namespace).await?;
        let replaced = api.replace(&key.name, &PostParams::default(), &obj).await.map_err(|e| {
            counter!("apply_err", 1u64);
            map_kube_err(e)
        })?;
        histogram!("client_write_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(target = %key, "replaced");
        to_json(&replaced)
    }

    async fn patch(&self, key: &ResourceKey, body: &Json, kind: PatchKind) -> ReleaseResult<Json> {
        let (api, rt) = self.api(&key.kind, key.api_version.as_deref(), key.namespace.as_deref()).await?;
        let pp = PatchParams::default();
        let patched = match kind.effective(body) {
            PatchKind::Strategic => api.patch(&key.name, &pp, &Patch::Strategic(body)).await.map_err(map_kube_err)?,
            PatchKind::Merge => api.patch(&key.name, &pp, &Patch::Merge(body)).await.map_err(map_kube_err)?,
            PatchKind::Json => self.json_patch(key, &rt, body).await?,
        };
        to_json(&patched)
    }

    async fn delete(&self, key: &ResourceKey) -> ReleaseResult<()> {
        let (api, _) = self.api(&key.kind, key.api_version.as_deref(), key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(map_kube_err)?;
        debug!(target = %key, "delete requested");
        Ok(())
    }

    async fn list(
        &self,
        kind: &str,
        api_version: Option<&str>,
        namespace: Option<&str>,
        field_selector: Option<&str>,
    ) -> ReleaseResult<Vec<Json>> {
        let rt = self.discovery.get_preferred_resource(kind, api_version).await?;
        let ar = rt.api_resource();
        let api: Api<DynamicObject> = match (rt.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if let Some(sel) = field_selector {
            lp = lp.fields(sel);
        }
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        list.items.iter().map(to_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryCache;
    use crate::test_support::{core_types, MockService};
    use crate::UpdateMethod;

    async fn client_with(svc: MockService) -> DynamicClient {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let source = Arc::new(core_types());
        let discovery = ResourceDiscovery::load("test", backend, source).await.unwrap();
        DynamicClient::new(svc.into_client(), discovery)
    }

    fn cm_json(name: &str) -> String {
        serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "dev", "resourceVersion": "7", "uid": "u-1"},
            "data": {"k": "v"}
        })
        .to_string()
    }

    #[tokio::test]
    async fn get_or_none_maps_404_to_none() {
        let dc = client_with(MockService::new()).await;
        let key = ResourceKey::new("ConfigMap", Some("dev"), "missing");
        assert_eq!(dc.get_or_none(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_or_none_propagates_other_statuses() {
        let forbidden = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"configmaps is forbidden","reason":"Forbidden","code":403}"#;
        let svc = MockService::new().on("GET", "/api/v1/namespaces/dev/configmaps/secret-ish", 403, forbidden);
        let dc = client_with(svc).await;
        let key = ResourceKey::new("ConfigMap", Some("dev"), "secret-ish");
        match dc.get_or_none(&key).await.unwrap_err() {
            ReleaseError::ApiStatus { code, message } => {
                assert_eq!(code, 403);
                assert!(message.contains("forbidden"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn delete_ignore_nonexistent_swallows_404() {
        let dc = client_with(MockService::new()).await;
        let key = ResourceKey::new("ConfigMap", Some("dev"), "gone");
        dc.delete_ignore_nonexistent(&key).await.unwrap();
        assert!(dc.delete(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_or_create_creates_when_absent() {
        let svc = MockService::new().on("POST", "/api/v1/namespaces/dev/configmaps", 201, &cm_json("fresh"));
        let dc = client_with(svc.clone()).await;
        let body: Json = serde_json::from_str(&cm_json("fresh")).unwrap();
        let out = dc.update_or_create(&body, None, UpdateMethod::default()).await.unwrap();
        assert!(out.created);
        assert_eq!(svc.requests(), vec![
            ("GET".to_string(), "/api/v1/namespaces/dev/configmaps/fresh".to_string()),
            ("POST".to_string(), "/api/v1/namespaces/dev/configmaps".to_string()),
        ]);
    }

    #[tokio::test]
    async fn update_or_create_replaces_when_present() {
        let path = "/api/v1/namespaces/dev/configmaps/live";
        let svc = MockService::new().on("GET", path, 200, &cm_json("live")).on("PUT", path, 200, &cm_json("live"));
        let dc = client_with(svc.clone()).await;
        let body: Json = serde_json::from_str(&cm_json("live")).unwrap();
        let out = dc.update_or_create(&body, None, UpdateMethod::Replace { auto_resource_version: true }).await.unwrap();
        assert!(!out.created);
        assert!(svc.requests().iter().any(|(m, p)| m == "PUT" && p == path));
    }

    #[tokio::test]
    async fn namespaced_kind_without_namespace_is_rejected() {
        let dc = client_with(MockService::new()).await;
        let key = ResourceKey::new("ConfigMap", None, "x");
        assert!(dc.get_or_none(&key).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn transport_failures_are_distinct() {
        let dc = client_with(MockService::new().broken()).await;
        let key = ResourceKey::new("ConfigMap", Some("dev"), "x");
        assert!(matches!(dc.get_or_none(&key).await.unwrap_err(), ReleaseError::Transport(_)));
    }
}

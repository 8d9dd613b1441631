//! Test helpers: a canned API server behind a real `kube::Client`, and static discovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use deckhand_core::ReleaseResult;
use http::{Request, Response};
use kube::client::Body;
use kube::Client;
use tower::Service;

use crate::discovery::{Discoverer, ResourceType, ServedGroupVersion};

const NOT_FOUND: &str = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"not found","reason":"NotFound","code":404}"#;

/// Returns predefined responses keyed by (method, path); unmatched requests get a 404 Status.
#[derive(Clone, Default)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    seen: Arc<Mutex<Vec<(String, String)>>>,
    broken: bool,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    /// Every request fails before reaching the "server".
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn into_client(self) -> Client {
        Client::new(self, "default")
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        self.seen.lock().unwrap().push((method.clone(), path.clone()));
        let found = self.responses.lock().unwrap().get(&(method, path)).cloned();
        let broken = self.broken;
        Box::pin(async move {
            if broken {
                return Err("connection refused".into());
            }
            let (status, body) = found.unwrap_or_else(|| (404, NOT_FOUND.to_string()));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Discovery answering from a fixed list.
pub struct StaticDiscoverer(pub Vec<ResourceType>);

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn group_versions(&self) -> ReleaseResult<Vec<ServedGroupVersion>> {
        let mut out: Vec<ServedGroupVersion> = Vec::new();
        for r in &self.0 {
            if !out.iter().any(|gv| gv.group == r.group && gv.version == r.version) {
                out.push(ServedGroupVersion { group: r.group.clone(), version: r.version.clone(), preferred: r.preferred });
            }
        }
        Ok(out)
    }

    async fn discover_group_version(&self, group: &str, version: &str) -> ReleaseResult<Vec<ResourceType>> {
        Ok(self.0.iter().filter(|r| r.group == group && r.version == version).cloned().collect())
    }
}

pub fn core_types() -> StaticDiscoverer {
    let t = |group: &str, kind: &str, plural: &str, namespaced: bool| ResourceType {
        group: group.into(),
        version: "v1".into(),
        kind: kind.into(),
        plural: plural.into(),
        namespaced,
        preferred: true,
    };
    StaticDiscoverer(vec![
        t("", "ConfigMap", "configmaps", true),
        t("", "Secret", "secrets", true),
        t("", "Service", "services", true),
        t("", "Namespace", "namespaces", false),
        t("apps", "Deployment", "deployments", true),
    ])
}

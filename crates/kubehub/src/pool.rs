//! Per-(token, project, cluster) client cache with explicit invalidation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deckhand_core::store::CacheBackend;
use deckhand_core::{ReleaseError, ReleaseResult};
use kube::Client;
use tracing::{debug, info};

use crate::client::DynamicClient;
use crate::ResourceClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub token: String,
    pub project_id: String,
    pub cluster_id: String,
}

impl ClientKey {
    pub fn new(token: &str, project_id: &str, cluster_id: &str) -> Self {
        Self { token: token.to_string(), project_id: project_id.to_string(), cluster_id: cluster_id.to_string() }
    }
}

/// Where and how to reach one cluster's API server.
#[derive(Clone)]
pub struct ClusterCredentials {
    pub server: String,
    pub bearer_token: String,
    /// DER-encoded CA certificate.
    pub ca_der: Option<Vec<u8>>,
    pub insecure: bool,
}

impl std::fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("server", &self.server)
            .field("bearer_token", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Resolves (cluster_id, project_id, token) to API server credentials.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, cluster_id: &str, project_id: &str, token: &str) -> ReleaseResult<ClusterCredentials>;
}

/// Produces a raw kube client for a key.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, key: &ClientKey) -> ReleaseResult<Client>;
}

/// Builds clients from resolved credentials.
pub struct CredentialConnector {
    resolver: Arc<dyn CredentialResolver>,
    request_timeout: Duration,
}

impl CredentialConnector {
    pub fn new(resolver: Arc<dyn CredentialResolver>, request_timeout: Duration) -> Self {
        Self { resolver, request_timeout }
    }
}

pub fn client_from_credentials(creds: &ClusterCredentials, request_timeout: Duration) -> ReleaseResult<Client> {
    let url: http::Uri = creds
        .server
        .parse()
        .map_err(|e| ReleaseError::ConfigValidation(format!("invalid api server url {}: {}", creds.server, e)))?;
    let mut cfg = kube::Config::new(url);
    cfg.auth_info.token = Some(creds.bearer_token.clone().into());
    cfg.accept_invalid_certs = creds.insecure;
    if let Some(ca) = &creds.ca_der {
        cfg.root_cert = Some(vec![ca.clone()]);
    }
    cfg.read_timeout = Some(request_timeout);
    Client::try_from(cfg).map_err(|e| ReleaseError::Transport(format!("building client for {}: {}", creds.server, e)))
}

#[async_trait]
impl ClusterConnector for CredentialConnector {
    async fn connect(&self, key: &ClientKey) -> ReleaseResult<Client> {
        let creds = self.resolver.resolve(&key.cluster_id, &key.project_id, &key.token).await?;
        debug!(cluster = %key.cluster_id, server = %creds.server, "resolved cluster credentials");
        client_from_credentials(&creds, self.request_timeout)
    }
}

/// Ignores the key and uses the ambient kubeconfig / in-cluster config.
pub struct CurrentContext {
    pub request_timeout: Duration,
}

#[async_trait]
impl ClusterConnector for CurrentContext {
    async fn connect(&self, _key: &ClientKey) -> ReleaseResult<Client> {
        let mut cfg = kube::Config::infer()
            .await
            .map_err(|e| ReleaseError::ConfigValidation(format!("loading kube config: {}", e)))?;
        cfg.read_timeout = Some(self.request_timeout);
        Client::try_from(cfg).map_err(|e| ReleaseError::Transport(format!("building client: {}", e)))
    }
}

/// Owns dynamic clients keyed by (token, project, cluster). Entries live until
/// `invalidate`/`clear`; nothing is shared across keys.
pub struct ClientCache {
    connector: Arc<dyn ClusterConnector>,
    discovery_cache: Arc<dyn CacheBackend>,
    clients: Mutex<HashMap<ClientKey, Arc<DynamicClient>>>,
}

impl ClientCache {
    pub fn new(connector: Arc<dyn ClusterConnector>, discovery_cache: Arc<dyn CacheBackend>) -> Self {
        Self { connector, discovery_cache, clients: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientKey, Arc<DynamicClient>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn get_or_build(&self, key: &ClientKey) -> ReleaseResult<Arc<DynamicClient>> {
        let existing = self.lock().get(key).cloned();
        if let Some(c) = existing {
            return Ok(c);
        }
        let client = self.connector.connect(key).await?;
        let built = Arc::new(DynamicClient::connect(client, &key.cluster_id, self.discovery_cache.clone()).await?);
        info!(cluster = %key.cluster_id, project = %key.project_id, "dynamic client built");
        // A concurrent build for the same key may have won; keep the first.
        Ok(self.lock().entry(key.clone()).or_insert(built).clone())
    }

    /// Drop one client. Returns whether an entry existed.
    pub fn invalidate(&self, key: &ClientKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Bind a token/project pair; the result hands out clients per cluster id.
    pub fn scoped(self: &Arc<Self>, token: &str, project_id: &str) -> ScopedClients {
        ScopedClients { cache: self.clone(), token: token.to_string(), project_id: project_id.to_string() }
    }
}

/// Hands out a resource client for a cluster id.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client(&self, cluster_id: &str) -> ReleaseResult<Arc<dyn ResourceClient>>;
}

pub struct ScopedClients {
    cache: Arc<ClientCache>,
    token: String,
    project_id: String,
}

#[async_trait]
impl ClientFactory for ScopedClients {
    async fn client(&self, cluster_id: &str) -> ReleaseResult<Arc<dyn ResourceClient>> {
        let key = ClientKey::new(&self.token, &self.project_id, cluster_id);
        let c: Arc<dyn ResourceClient> = self.cache.get_or_build(&key).await?;
        Ok(c)
    }
}

/// Every cluster id maps to the same client. Used with `MemoryCluster` and single-cluster tools.
pub struct SingleClient(pub Arc<dyn ResourceClient>);

#[async_trait]
impl ClientFactory for SingleClient {
    async fn client(&self, _cluster_id: &str) -> ReleaseResult<Arc<dyn ResourceClient>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryCache;
    use crate::test_support::{core_types, MockService};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a mock client; discovery is pre-seeded so no discovery requests are made.
    struct MockConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ClusterConnector for MockConnector {
        async fn connect(&self, _key: &ClientKey) -> ReleaseResult<Client> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MockService::new().into_client())
        }
    }

    async fn seeded_cache(clusters: &[&str]) -> Arc<dyn CacheBackend> {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        for c in clusters {
            crate::discovery::ResourceDiscovery::load(c, backend.clone(), Arc::new(core_types())).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn clients_are_memoized_per_key_and_invalidated_explicitly() {
        let connector = Arc::new(MockConnector { connects: AtomicUsize::new(0) });
        let cache = Arc::new(ClientCache::new(connector.clone(), seeded_cache(&["c1", "c2"]).await));
        let k1 = ClientKey::new("tok-a", "p1", "c1");
        let a = cache.get_or_build(&k1).await.unwrap();
        let b = cache.get_or_build(&k1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // another tenant never sees tok-a's client
        let other = cache.get_or_build(&ClientKey::new("tok-b", "p1", "c1")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(cache.len(), 2);

        assert!(cache.invalidate(&k1));
        assert!(!cache.invalidate(&k1));
        let rebuilt = cache.get_or_build(&k1).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &rebuilt));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn scoped_factory_keys_by_cluster() {
        let connector = Arc::new(MockConnector { connects: AtomicUsize::new(0) });
        let cache = Arc::new(ClientCache::new(connector.clone(), seeded_cache(&["c1", "c2"]).await));
        let scoped = cache.scoped("tok", "p1");
        scoped.client("c1").await.unwrap();
        scoped.client("c2").await.unwrap();
        scoped.client("c1").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_server_url_is_a_validation_error() {
        let creds = ClusterCredentials { server: "not a url".into(), bearer_token: "t".into(), ca_der: None, insecure: false };
        let err = client_from_credentials(&creds, Duration::from_secs(1)).err();
        assert!(err.map_or(false, |e| e.is_validation()));
    }

    #[test]
    fn credentials_debug_redacts_token() {
        let creds = ClusterCredentials { server: "https://k8s:6443".into(), bearer_token: "s3cr3t".into(), ca_der: None, insecure: false };
        assert!(!format!("{:?}", creds).contains("s3cr3t"));
    }
}

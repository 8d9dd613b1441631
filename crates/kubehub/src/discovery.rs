//! Resource type discovery backed by a persisted, version-tagged cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deckhand_core::manifest::split_api_version;
use deckhand_core::store::CacheBackend;
use deckhand_core::{ReleaseError, ReleaseResult};
use kube::core::{ApiResource, GroupVersion};
use kube::discovery::{ApiCapabilities, Scope};
use kube::Client;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::map_kube_err;

/// Bumped whenever the cached layout changes; entries with another tag are rebuilt.
pub const CACHE_FORMAT: &str = concat!(env!("CARGO_PKG_VERSION"), "+1");

/// How long an unresolvable kind is answered from memory before discovery runs again.
pub const DEFAULT_MISS_TTL: Duration = Duration::from_secs(30);

/// A served resource: group/version/kind plus REST plural and scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    /// Version is the group's preferred one.
    pub preferred: bool,
}

impl ResourceType {
    pub fn from_kube(ar: &ApiResource, caps: &ApiCapabilities, preferred: bool) -> Self {
        Self {
            group: ar.group.clone(),
            version: ar.version.clone(),
            kind: ar.kind.clone(),
            plural: ar.plural.clone(),
            namespaced: matches!(caps.scope, Scope::Namespaced),
            preferred,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

/// Everything a cluster serves, ordered core group first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMap {
    resources: Vec<ResourceType>,
}

impl TypeMap {
    pub fn new(mut resources: Vec<ResourceType>) -> Self {
        sort_core_first(&mut resources);
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> &[ResourceType] {
        &self.resources
    }

    /// Replace entries for the same group/version/kind, append the rest. Known
    /// entries keep their preferred flag; new ones are preferred only when their
    /// group was not served at all before.
    pub fn merge(&mut self, fetched: Vec<ResourceType>) {
        let known_groups: HashSet<String> = self.resources.iter().map(|r| r.group.clone()).collect();
        for mut rt in fetched {
            match self.resources.iter_mut().find(|r| r.group == rt.group && r.version == rt.version && r.kind == rt.kind) {
                Some(slot) => {
                    rt.preferred = slot.preferred;
                    *slot = rt;
                }
                None => {
                    rt.preferred = !known_groups.contains(&rt.group);
                    self.resources.push(rt);
                }
            }
        }
        sort_core_first(&mut self.resources);
    }

    /// Entries for `kind`, optionally pinned to an api version. Exact kind matches win
    /// over case-insensitive ones.
    pub fn matching(&self, kind: &str, api_version: Option<&str>) -> Vec<&ResourceType> {
        let gv = api_version.map(split_api_version);
        let in_gv = |r: &&ResourceType| gv.as_ref().map_or(true, |(g, v)| &r.group == g && &r.version == v);
        let exact: Vec<_> = self.resources.iter().filter(|r| r.kind == kind).filter(in_gv).collect();
        if !exact.is_empty() {
            return exact;
        }
        self.resources.iter().filter(|r| r.kind.eq_ignore_ascii_case(kind)).filter(in_gv).collect()
    }

    /// Single match, else the single preferred match, else the first match.
    pub fn preferred(&self, kind: &str, api_version: Option<&str>) -> Option<ResourceType> {
        let candidates = self.matching(kind, api_version);
        if candidates.len() <= 1 {
            return candidates.first().map(|r| (*r).clone());
        }
        let preferred: Vec<_> = candidates.iter().filter(|r| r.preferred).collect();
        if preferred.len() == 1 {
            return Some((**preferred[0]).clone());
        }
        debug!(kind, candidates = candidates.len(), preferred = preferred.len(), "ambiguous kind; taking first match");
        Some(candidates[0].clone())
    }
}

fn sort_core_first(resources: &mut [ResourceType]) {
    resources.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    library_version: String,
    resources: Vec<ResourceType>,
}

/// A group/version listed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedGroupVersion {
    pub group: String,
    pub version: String,
    /// The group's preferred version.
    pub preferred: bool,
}

/// Source of truth for served resources (the API server, or a fake in tests).
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Every group/version listed under `/api` and `/apis`.
    async fn group_versions(&self) -> ReleaseResult<Vec<ServedGroupVersion>>;

    /// Resources of one group/version. A removed group/version is an `ApiStatus` 404.
    /// The `preferred` flag of the returned entries is left to the caller.
    async fn discover_group_version(&self, group: &str, version: &str) -> ReleaseResult<Vec<ResourceType>>;
}

pub struct KubeDiscoverer {
    client: Client,
}

impl KubeDiscoverer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Discoverer for KubeDiscoverer {
    async fn group_versions(&self) -> ReleaseResult<Vec<ServedGroupVersion>> {
        let core = self.client.list_core_api_versions().await.map_err(map_kube_err)?;
        let mut out: Vec<ServedGroupVersion> = core
            .versions
            .iter()
            .enumerate()
            .map(|(i, v)| ServedGroupVersion { group: String::new(), version: v.clone(), preferred: i == 0 })
            .collect();
        let groups = self.client.list_api_groups().await.map_err(map_kube_err)?;
        for g in groups.groups {
            let preferred = g.preferred_version.as_ref().or(g.versions.first()).map(|v| v.version.clone());
            for v in &g.versions {
                out.push(ServedGroupVersion {
                    group: g.name.clone(),
                    version: v.version.clone(),
                    preferred: preferred.as_deref() == Some(v.version.as_str()),
                });
            }
        }
        Ok(out)
    }

    async fn discover_group_version(&self, group: &str, version: &str) -> ReleaseResult<Vec<ResourceType>> {
        let gv = GroupVersion::gv(group, version);
        let api_group = kube::discovery::oneshot::pinned_group(&self.client, &gv).await.map_err(map_kube_err)?;
        Ok(api_group
            .versioned_resources(version)
            .into_iter()
            .map(|(ar, caps)| ResourceType::from_kube(&ar, &caps, false))
            .collect())
    }
}

/// Resolves kinds for one cluster. Reads through the cache backend on load and
/// rebuilds it on miss, tag mismatch or undecodable payload.
pub struct ResourceDiscovery {
    cache_key: String,
    backend: Arc<dyn CacheBackend>,
    source: Arc<dyn Discoverer>,
    types: RwLock<Option<TypeMap>>,
    misses: Mutex<HashMap<String, Instant>>,
    miss_ttl: Duration,
}

impl ResourceDiscovery {
    pub fn cache_key_for(cluster_id: &str) -> String {
        format!("discovery:{}", cluster_id)
    }

    /// Build and warm: the cache is read (or rebuilt) before returning.
    pub async fn load(cluster_id: &str, backend: Arc<dyn CacheBackend>, source: Arc<dyn Discoverer>) -> ReleaseResult<Self> {
        let me = Self {
            cache_key: Self::cache_key_for(cluster_id),
            backend,
            source,
            types: RwLock::new(None),
            misses: Mutex::new(HashMap::new()),
            miss_ttl: DEFAULT_MISS_TTL,
        };
        me.ensure_loaded().await?;
        Ok(me)
    }

    pub fn with_miss_ttl(mut self, ttl: Duration) -> Self {
        self.miss_ttl = ttl;
        self
    }

    fn current(&self) -> Option<TypeMap> {
        self.types.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self, map: Option<TypeMap>) {
        *self.types.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    fn read_cache(&self) -> Option<TypeMap> {
        let text = match self.backend.get(&self.cache_key) {
            Ok(Some(t)) => t,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "discovery cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<CacheEnvelope>(&text) {
            Ok(env) if env.library_version == CACHE_FORMAT => Some(TypeMap::new(env.resources)),
            Ok(env) => {
                info!(key = %self.cache_key, cached = %env.library_version, current = CACHE_FORMAT, "discovery cache version mismatch");
                None
            }
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "discarding undecodable discovery cache");
                None
            }
        }
    }

    /// Cache writes never fail the caller; failures are counted.
    fn write_cache(&self, map: &TypeMap) {
        let env = CacheEnvelope { library_version: CACHE_FORMAT.to_string(), resources: map.resources().to_vec() };
        let res = serde_json::to_string(&env)
            .map_err(anyhow::Error::from)
            .and_then(|text| self.backend.set(&self.cache_key, &text));
        if let Err(e) = res {
            counter!("discovery_cache_write_errors_total", 1u64);
            warn!(key = %self.cache_key, error = %e, "discovery cache write failed");
        }
    }

    async fn ensure_loaded(&self) -> ReleaseResult<()> {
        if self.current().is_some() {
            return Ok(());
        }
        if let Some(map) = self.read_cache() {
            debug!(key = %self.cache_key, resources = map.len(), "discovery cache hit");
            self.store(Some(map));
            return Ok(());
        }
        self.refresh().await
    }

    /// Full discovery and cache rewrite. Each listed group/version is fetched on
    /// its own so one the server stopped serving is skipped.
    pub async fn refresh(&self) -> ReleaseResult<()> {
        let listed = self.source.group_versions().await?;
        let mut all = Vec::new();
        for gv in &listed {
            let fetched = self.resources_for(&gv.group, &gv.version).await?;
            all.extend(fetched.into_iter().map(|r| ResourceType { preferred: gv.preferred, ..r }));
        }
        counter!("discovery_refresh_total", 1u64);
        let map = TypeMap::new(all);
        info!(key = %self.cache_key, group_versions = listed.len(), resources = map.len(), "discovery refreshed");
        self.write_cache(&map);
        self.store(Some(map));
        self.lock_misses().clear();
        Ok(())
    }

    /// Drop the in-memory and persisted copies; the next lookup rediscovers.
    pub fn invalidate(&self) {
        self.store(None);
        self.lock_misses().clear();
        if let Err(e) = self.backend.delete(&self.cache_key) {
            warn!(key = %self.cache_key, error = %e, "discovery cache delete failed");
        }
    }

    fn lock_misses(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.misses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resources of one group/version straight from the server. A group/version the
    /// server no longer serves yields an empty list instead of an error.
    pub async fn resources_for(&self, group: &str, version: &str) -> ReleaseResult<Vec<ResourceType>> {
        match self.source.discover_group_version(group, version).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_not_found() => {
                warn!(group, version, "group/version no longer served; ignoring");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a kind (optionally pinned to an api version) to a concrete resource.
    pub async fn get_preferred_resource(&self, kind: &str, api_version: Option<&str>) -> ReleaseResult<ResourceType> {
        self.ensure_loaded().await?;
        if let Some(found) = self.current().and_then(|m| m.preferred(kind, api_version)) {
            return Ok(found);
        }
        let not_found = || match api_version {
            Some(av) => ReleaseError::ResourceTypeNotFound(format!("{}/{}", av, kind)),
            None => ReleaseError::ResourceTypeNotFound(kind.to_string()),
        };
        let miss_key = format!("{}|{}", api_version.unwrap_or(""), kind);
        if self.lock_misses().get(&miss_key).is_some_and(|at| at.elapsed() < self.miss_ttl) {
            debug!(kind, api_version, "kind recently unresolvable; skipping rediscovery");
            return Err(not_found());
        }
        match api_version {
            Some(av) => {
                let (group, version) = split_api_version(av);
                let fetched = self.resources_for(&group, &version).await?;
                if !fetched.is_empty() {
                    let mut map = self.current().unwrap_or_default();
                    map.merge(fetched);
                    self.write_cache(&map);
                    self.store(Some(map));
                }
            }
            None => self.refresh().await?,
        }
        match self.current().and_then(|m| m.preferred(kind, api_version)) {
            Some(found) => Ok(found),
            None => {
                self.lock_misses().insert(miss_key, Instant::now());
                Err(not_found())
            }
        }
    }
}

/// In-process cache backend. `failing_writes` simulates an unavailable cache store.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    failing_writes: bool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        Self { failing_writes: true, ..Self::default() }
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.failing_writes {
            return Err(anyhow!("cache backend unavailable"));
        }
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

//! In-memory cluster implementing `ResourceClient`, a test double for the API
//! server. Keeps a call journal, supports failure injection, artificial latency
//! and deletions that never complete.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use deckhand_core::manifest::{ensure_metadata, resource_version, strip_noisy};
use deckhand_core::{ReleaseError, ReleaseResult, ResourceKey};
use serde_json::Value as Json;

use crate::{PatchKind, ResourceClient};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ResourceKey),
    Create(ResourceKey),
    Replace(ResourceKey),
    Patch(ResourceKey, PatchKind),
    Delete(ResourceKey),
    List(String),
}

impl Call {
    pub fn verb(&self) -> Verb {
        match self {
            Call::Get(_) => Verb::Get,
            Call::Create(_) => Verb::Create,
            Call::Replace(_) => Verb::Replace,
            Call::Patch(..) => Verb::Patch,
            Call::Delete(_) => Verb::Delete,
            Call::List(_) => Verb::List,
        }
    }

    pub fn key(&self) -> Option<&ResourceKey> {
        match self {
            Call::Get(k) | Call::Create(k) | Call::Replace(k) | Call::Patch(k, _) | Call::Delete(k) => Some(k),
            Call::List(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Replace,
    Patch,
    Delete,
    List,
}

type ObjKey = (String, Option<String>, String);
type ErrorFn = Arc<dyn Fn() -> ReleaseError + Send + Sync>;

struct Fault {
    verb: Verb,
    kind: String,
    name: String,
    make: ErrorFn,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjKey, Json>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    next_rv: u64,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    stuck_deletes: bool,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn obj_key(key: &ResourceKey) -> ObjKey {
    (key.kind.to_ascii_lowercase(), key.namespace.clone(), key.name.clone())
}

fn not_found(key: &ResourceKey) -> ReleaseError {
    ReleaseError::api(404, format!("{} \"{}\" not found", key.kind.to_ascii_lowercase(), key.name))
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes are acknowledged but objects stay listed.
    pub fn with_stuck_deletes(mut self) -> Self {
        self.stuck_deletes = true;
        self
    }

    /// Every write sleeps this long; lets tests observe concurrency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail `verb` on `kind`/`name` (`"*"` matches any name) with the error `make` builds.
    pub fn fail(&self, verb: Verb, kind: &str, name: &str, make: impl Fn() -> ReleaseError + Send + Sync + 'static) {
        self.lock().faults.push(Fault { verb, kind: kind.to_string(), name: name.to_string(), make: Arc::new(make) });
    }

    /// Drop every injected failure.
    pub fn heal(&self) {
        self.lock().faults.clear();
    }

    /// Seed an object without journaling a call.
    pub fn insert(&self, obj: Json) -> ReleaseResult<()> {
        let key = ResourceKey::from_manifest(&obj, None)?;
        let mut st = self.lock();
        let stored = Self::stamp(&mut st, obj, &key, None);
        st.objects.insert(obj_key(&key), stored);
        Ok(())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Names touched by `verb`, in call order.
    pub fn names_for(&self, verb: Verb) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb() == verb)
            .filter_map(|c| c.key().map(|k| k.name.clone()))
            .collect()
    }

    pub fn objects(&self) -> Vec<Json> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Json> {
        let key = ResourceKey::new(kind, namespace, name);
        self.lock().objects.get(&obj_key(&key)).cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn stamp(st: &mut State, mut obj: Json, key: &ResourceKey, uid: Option<Json>) -> Json {
        st.next_rv += 1;
        ensure_metadata(&mut obj, &key.name, key.namespace.as_deref());
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(st.next_rv.to_string()));
            meta.insert("uid".into(), uid.unwrap_or_else(|| Json::String(format!("uid-{}", st.next_rv))));
        }
        obj
    }

    fn record(&self, call: Call) -> ReleaseResult<()> {
        let mut st = self.lock();
        let fault = call.key().and_then(|k| {
            st.faults
                .iter()
                .find(|f| f.verb == call.verb() && f.kind.eq_ignore_ascii_case(&k.kind) && (f.name == "*" || f.name == k.name))
                .map(|f| f.make.clone())
        });
        st.calls.push(call);
        match fault {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }

    async fn pace(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn merge_patch(target: &mut Json, patch: &Json) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn json_patch(target: &mut Json, ops: &Json) -> ReleaseResult<()> {
    let invalid = |m: String| ReleaseError::api(422, m);
    for op in ops.as_array().into_iter().flatten() {
        let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or_default();
        let path = op.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        let (parent, last) = path.rsplit_once('/').ok_or_else(|| invalid(format!("invalid path {}", path)))?;
        let last = unescape(last);
        let node = target.pointer_mut(parent).ok_or_else(|| invalid(format!("path {} does not exist", parent)))?;
        match (kind, node) {
            ("add" | "replace", Json::Object(map)) => {
                map.insert(last, op.get("value").cloned().unwrap_or(Json::Null));
            }
            ("add" | "replace", Json::Array(arr)) => {
                let value = op.get("value").cloned().unwrap_or(Json::Null);
                match last.as_str() {
                    "-" => arr.push(value),
                    idx => {
                        let i: usize = idx.parse().map_err(|_| invalid(format!("bad index {}", idx)))?;
                        if kind == "replace" && i < arr.len() { arr[i] = value } else if i <= arr.len() { arr.insert(i, value) }
                    }
                }
            }
            ("remove", Json::Object(map)) => {
                map.remove(&last);
            }
            ("remove", Json::Array(arr)) => {
                if let Ok(i) = last.parse::<usize>() {
                    if i < arr.len() { arr.remove(i); }
                }
            }
            (other, _) => return Err(invalid(format!("unsupported json patch op {} at {}", other, path))),
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceClient for MemoryCluster {
    async fn get_or_none(&self, key: &ResourceKey) -> ReleaseResult<Option<Json>> {
        self.record(Call::Get(key.clone()))?;
        Ok(self.lock().objects.get(&obj_key(key)).cloned())
    }

    async fn create(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json> {
        let key = ResourceKey::from_manifest(body, namespace)?;
        self.record(Call::Create(key.clone()))?;
        self.pace().await;
        let mut st = self.lock();
        if st.objects.contains_key(&obj_key(&key)) {
            return Err(ReleaseError::api(409, format!("{} \"{}\" already exists", key.kind.to_ascii_lowercase(), key.name)));
        }
        let stored = Self::stamp(&mut st, body.clone(), &key, None);
        st.objects.insert(obj_key(&key), stored.clone());
        Ok(stored)
    }

    async fn replace(&self, body: &Json, namespace: Option<&str>) -> ReleaseResult<Json> {
        let key = ResourceKey::from_manifest(body, namespace)?;
        self.record(Call::Replace(key.clone()))?;
        self.pace().await;
        let mut st = self.lock();
        let live = st.objects.get(&obj_key(&key)).cloned().ok_or_else(|| not_found(&key))?;
        if let Some(rv) = resource_version(body) {
            if Some(rv) != resource_version(&live) {
                return Err(ReleaseError::api(409, format!("the object has been modified; resourceVersion {} is stale", rv)));
            }
        }
        let mut desired = body.clone();
        ensure_metadata(&mut desired, &key.name, key.namespace.as_deref());
        if strip_noisy(desired) == strip_noisy(live.clone()) {
            return Ok(live);
        }
        let uid = live.get("metadata").and_then(|m| m.get("uid")).cloned();
        let stored = Self::stamp(&mut st, body.clone(), &key, uid);
        st.objects.insert(obj_key(&key), stored.clone());
        Ok(stored)
    }

    async fn patch(&self, key: &ResourceKey, body: &Json, kind: PatchKind) -> ReleaseResult<Json> {
        let kind = kind.effective(body);
        self.record(Call::Patch(key.clone(), kind))?;
        self.pace().await;
        let mut st = self.lock();
        let live = st.objects.get(&obj_key(key)).cloned().ok_or_else(|| not_found(key))?;
        let mut patched = live.clone();
        match kind {
            PatchKind::Json => json_patch(&mut patched, body)?,
            PatchKind::Strategic | PatchKind::Merge => merge_patch(&mut patched, body),
        }
        if strip_noisy(patched.clone()) == strip_noisy(live.clone()) {
            return Ok(live);
        }
        let uid = live.get("metadata").and_then(|m| m.get("uid")).cloned();
        let stored = Self::stamp(&mut st, patched, key, uid);
        st.objects.insert(obj_key(key), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> ReleaseResult<()> {
        self.record(Call::Delete(key.clone()))?;
        self.pace().await;
        let mut st = self.lock();
        if !st.objects.contains_key(&obj_key(key)) {
            return Err(not_found(key));
        }
        if !self.stuck_deletes {
            st.objects.remove(&obj_key(key));
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: &str,
        _api_version: Option<&str>,
        namespace: Option<&str>,
        field_selector: Option<&str>,
    ) -> ReleaseResult<Vec<Json>> {
        self.record(Call::List(kind.to_string()))?;
        let name = field_selector.and_then(|s| s.strip_prefix("metadata.name="));
        let kind = kind.to_ascii_lowercase();
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, n), _)| {
                *k == kind && namespace.map_or(true, |want| ns.as_deref() == Some(want)) && name.map_or(true, |want| n == want)
            })
            .map(|(_, v)| v.clone())
            .collect())
    }
}

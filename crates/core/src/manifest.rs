//! Manifest parsing, targeting and diff helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{ReleaseError, ReleaseResult};
use crate::{ResourceKey, ResourceSpec};

/// Size guards applied before a YAML payload is turned into specs.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl From<&crate::EngineConfig> for ParseLimits {
    fn from(c: &crate::EngineConfig) -> Self {
        Self { max_bytes: c.max_yaml_bytes, max_nodes: c.max_yaml_nodes }
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a (possibly multi-document) YAML payload into JSON documents. Empty documents are skipped.
pub fn parse_documents(yaml: &str, limits: ParseLimits) -> ReleaseResult<Vec<Json>> {
    if yaml.len() > limits.max_bytes {
        return Err(ReleaseError::ConfigValidation(format!("YAML payload too large (>{} bytes)", limits.max_bytes)));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| ReleaseError::ConfigValidation(format!("parsing YAML document {}: {}", idx, e)))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val)
            .map_err(|e| ReleaseError::ConfigValidation(format!("converting YAML document {} to JSON: {}", idx, e)))?;
        if json_node_budget_exceeded(&json, limits.max_nodes) {
            return Err(ReleaseError::ConfigValidation(format!("YAML document too complex (>{} nodes)", limits.max_nodes)));
        }
        out.push(json);
    }
    Ok(out)
}

/// Parse YAML into specs, one per document.
pub fn parse_specs(yaml: &str, ns_override: Option<&str>, limits: ParseLimits) -> ReleaseResult<Vec<ResourceSpec>> {
    parse_documents(yaml, limits)?
        .into_iter()
        .map(|doc| ResourceSpec::from_manifest(doc, ns_override))
        .collect()
}

pub(crate) fn target_of(json: &Json, ns_override: Option<&str>) -> ReleaseResult<ResourceKey> {
    let missing = |what: &str| ReleaseError::ConfigValidation(format!("manifest missing {}", what));
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| missing("apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| missing("kind"))?;
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing("metadata.name"))?;
    let namespace = ns_override
        .map(|s| s.to_string())
        .or_else(|| meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string()));
    Ok(ResourceKey {
        kind: kind.to_string(),
        api_version: Some(api_version.to_string()),
        namespace,
        name: name.to_string(),
    })
}

/// Split "group/version" into its parts; the core group is the empty string.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

pub fn resource_version(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|s| s.as_str())
}

/// Force `metadata.name` / `metadata.namespace` on a document.
pub fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert(Json::Object(serde_json::Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        if let Some(ns) = ns { obj.insert("namespace".into(), Json::String(ns.to_string())); }
    }
}

/// Drop server-populated fields before comparing desired and live state.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    /// True when the target introduces nothing the base lacks. Removes are server defaults.
    pub fn is_noop(&self) -> bool {
        self.adds == 0 && self.updates == 0
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { s.updates += 1; } }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_specs("kind: Foo\nmetadata:\n  name: x\n", None, ParseLimits::default()).unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = parse_specs("apiVersion: v1\nmetadata:\n  name: x\n", None, ParseLimits::default()).unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = parse_specs("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", None, ParseLimits::default()).unwrap_err();
        assert!(e3.is_validation());
        assert!(e3.to_string().contains("missing metadata.name"));
    }

    #[test]
    fn multi_document_yaml_skips_empty_docs() {
        let yaml = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: dev\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\n";
        let specs = parse_specs(yaml, None, ParseLimits::default()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, "ConfigMap");
        assert_eq!(specs[0].namespace.as_deref(), Some("dev"));
        assert_eq!(specs[1].api_version.as_deref(), Some("apps/v1"));
        assert_eq!(specs[1].namespace, None);

        let overridden = parse_specs(yaml, Some("prod"), ParseLimits::default()).unwrap();
        assert!(overridden.iter().all(|s| s.namespace.as_deref() == Some("prod")));
    }

    #[test]
    fn budgets_reject_oversized_payloads() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  a: b\n  c: d\n";
        let tiny = ParseLimits { max_bytes: 10, max_nodes: 100 };
        assert!(parse_documents(yaml, tiny).unwrap_err().to_string().contains("too large"));
        let shallow = ParseLimits { max_bytes: 10_000, max_nodes: 4 };
        assert!(parse_documents(yaml, shallow).unwrap_err().to_string().contains("too complex"));
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = serde_json::json!({
            "metadata": {"name": "x", "managedFields": [{}], "resourceVersion": "1", "uid": "u", "generation": 2},
            "status": {"ready": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn diff_ignores_server_defaults() {
        let target = serde_json::json!({"spec": {"replicas": 1}});
        let live = serde_json::json!({"spec": {"replicas": 1, "revisionHistoryLimit": 10}});
        let d = diff_summary(&target, &live);
        assert_eq!(d, DiffSummary { adds: 0, updates: 0, removes: 1 });
        assert!(d.is_noop());

        let changed = serde_json::json!({"spec": {"replicas": 2, "paused": true}});
        let d2 = diff_summary(&changed, &live);
        assert_eq!(d2.updates, 1);
        assert_eq!(d2.adds, 1);
        assert!(!d2.is_noop());
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(split_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
    }
}

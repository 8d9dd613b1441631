use std::sync::Arc;

use deckhand_apply::{Deployer, InstantiationRequest, KindRegistry, LegacyInstantiator, NamespaceBundle};
use deckhand_core::store::InstanceStore;
use deckhand_core::{InstanceState, ReleaseError, ResourceSpec};
use deckhand_kubehub::mock::Verb;
use deckhand_kubehub::{MemoryCluster, SingleClient};
use deckhand_persist::SqliteStore;
use serde_json::json;

fn spec(kind: &str, name: &str) -> ResourceSpec {
    let api_version = match kind {
        "Deployment" | "DaemonSet" | "StatefulSet" => "apps/v1",
        "HorizontalPodAutoscaler" => "autoscaling/v2",
        _ => "v1",
    };
    ResourceSpec {
        kind: kind.into(),
        name: name.into(),
        namespace: None,
        manifest: json!({"apiVersion": api_version, "kind": kind, "metadata": {"name": name}}),
        api_version: None,
    }
}

struct Harness {
    cluster: Arc<MemoryCluster>,
    store: Arc<SqliteStore>,
    inst: LegacyInstantiator,
}

fn harness_with(registry: impl FnOnce(KindRegistry) -> KindRegistry) -> Harness {
    let cluster = Arc::new(MemoryCluster::new());
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let reg = registry(KindRegistry::with_defaults(Arc::new(SingleClient(cluster.clone()))));
    let inst = LegacyInstantiator::new(reg, store.clone());
    Harness { cluster, store, inst }
}

fn harness() -> Harness {
    harness_with(|r| r)
}

fn create(bundles: Vec<NamespaceBundle>) -> InstantiationRequest {
    InstantiationRequest { bundles, is_update: false }
}

#[tokio::test]
async fn failed_deployment_unwinds_configmap_then_secret() {
    let h = harness();
    h.cluster.fail(Verb::Create, "Deployment", "*", || ReleaseError::ConfigValidation("bad image".into()));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("secret", spec("Secret", "S"))
        .with("configmap", spec("ConfigMap", "C"))
        .with("deployment", spec("Deployment", "D"));

    let res = h.inst.apply(&create(vec![bundle])).await.unwrap();

    assert_eq!(h.cluster.names_for(Verb::Create), vec!["S", "C", "D"]);
    assert_eq!(h.cluster.names_for(Verb::Delete), vec!["C", "S"]);
    assert!(h.cluster.objects().is_empty());
    assert_eq!(
        serde_json::to_value(&res).unwrap(),
        json!({"success": [], "failed": [{"ns_id": "ns-1", "res_type": "deployment", "err_msg": "bad image"}]})
    );
    assert!(res.failed[0].show_verbatim);
    assert!(res.failed[0].rollback.iter().all(|o| o.attempted && o.succeeded));
}

#[tokio::test]
async fn instance_state_is_persisted_for_every_resource() {
    let h = harness();
    h.cluster.fail(Verb::Create, "Deployment", "*", || ReleaseError::ConfigValidation("bad image".into()));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("secret", spec("Secret", "S"))
        .with("deployment", spec("Deployment", "D"))
        .with("statefulset", spec("StatefulSet", "never"));

    h.inst.instantiate(&create(vec![bundle])).await;

    let recs = h.store.list_instances("ns-1").unwrap();
    let state = |name: &str| recs.iter().find(|r| r.name == name).map(|r| (r.ins_state, r.deleted));
    assert_eq!(state("S"), Some((InstanceState::InsSuccess, true)));
    assert_eq!(state("D"), Some((InstanceState::InsFailed, false)));
    // never attempted
    assert_eq!(state("never"), Some((InstanceState::Pending, false)));
}

#[tokio::test]
async fn rollback_is_strictly_reverse_of_application() {
    let h = harness();
    h.cluster.fail(Verb::Create, "Service", "*", || ReleaseError::api(422, "port out of range"));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("configmap", spec("ConfigMap", "A"))
        .with("configmap", spec("ConfigMap", "B"))
        .with("configmap", spec("ConfigMap", "C"))
        .with("service", spec("Service", "svc"));

    let res = h.inst.instantiate(&create(vec![bundle])).await;

    assert_eq!(h.cluster.names_for(Verb::Delete), vec!["C", "B", "A"]);
    assert_eq!(res.failed[0].res_type, "service");
    assert_eq!(res.failed[0].err_msg, "port out of range");
    assert!(!res.failed[0].show_verbatim);
}

#[tokio::test]
async fn terminal_workloads_are_not_rolled_back() {
    let h = harness();
    h.cluster.fail(Verb::Create, "HorizontalPodAutoscaler", "*", || ReleaseError::Apply("hpa quota exceeded".into()));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("hpa", spec("HorizontalPodAutoscaler", "scale"))
        .with("deployment", spec("Deployment", "web"))
        .with("secret", spec("Secret", "S"));

    let res = h.inst.instantiate(&create(vec![bundle])).await;

    assert_eq!(h.cluster.names_for(Verb::Create), vec!["S", "web", "scale"]);
    assert_eq!(h.cluster.names_for(Verb::Delete), vec!["S"]);
    assert!(h.cluster.object("Deployment", Some("dev"), "web").is_some());
    assert_eq!(res.failed[0].err_msg, "hpa quota exceeded");
}

#[tokio::test]
async fn missing_rollback_operation_is_skipped_and_unwinding_continues() {
    let h = harness_with(|mut r| {
        r.unregister_rollback("configmap");
        r
    });
    h.cluster.fail(Verb::Create, "Service", "*", || ReleaseError::Transport("connection reset by peer".into()));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("secret", spec("Secret", "S"))
        .with("configmap", spec("ConfigMap", "C"))
        .with("service", spec("Service", "svc"));

    let res = h.inst.instantiate(&create(vec![bundle])).await;

    assert_eq!(h.cluster.names_for(Verb::Delete), vec!["S"]);
    let rb = &res.failed[0].rollback;
    assert_eq!(rb.len(), 2);
    assert_eq!((rb[0].name.as_str(), rb[0].attempted), ("C", false));
    assert_eq!((rb[1].name.as_str(), rb[1].attempted, rb[1].succeeded), ("S", true, true));
    // transport detail stays in the log
    assert_eq!(res.failed[0].err_msg, deckhand_core::error::GENERIC_USER_MESSAGE);
}

#[tokio::test]
async fn failing_rollback_does_not_stop_the_unwind() {
    let h = harness();
    h.cluster.fail(Verb::Create, "Deployment", "*", || ReleaseError::Apply("image pull denied".into()));
    h.cluster.fail(Verb::Delete, "ConfigMap", "C", || ReleaseError::api(500, "etcd unavailable"));
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("secret", spec("Secret", "S"))
        .with("configmap", spec("ConfigMap", "C"))
        .with("deployment", spec("Deployment", "D"));

    let res = h.inst.instantiate(&create(vec![bundle])).await;

    assert_eq!(h.cluster.names_for(Verb::Delete), vec!["C", "S"]);
    let rb = &res.failed[0].rollback;
    assert!(rb[0].attempted && !rb[0].succeeded);
    assert!(rb[0].error.as_deref().unwrap_or("").contains("etcd unavailable"));
    assert!(rb[1].succeeded);
    assert!(h.cluster.object("ConfigMap", Some("dev"), "C").is_some());
}

#[tokio::test]
async fn failed_update_leaves_existing_state_untouched() {
    let h = harness();
    h.cluster.fail(Verb::Replace, "Deployment", "*", || ReleaseError::ConfigValidation("replicas must be >= 0".into()));
    for s in [spec("ConfigMap", "C"), spec("Deployment", "D")] {
        h.cluster.insert(json!({
            "apiVersion": s.manifest["apiVersion"], "kind": s.kind, "metadata": {"name": s.name, "namespace": "dev"}
        }))
        .unwrap();
    }
    let bundle = NamespaceBundle::new("ns-1", "c1", "dev")
        .with("configmap", spec("ConfigMap", "C"))
        .with("deployment", spec("Deployment", "D"));

    let res = h.inst.instantiate(&InstantiationRequest { bundles: vec![bundle], is_update: true }).await;

    assert_eq!(res.failed[0].err_msg, "replicas must be >= 0");
    assert!(res.failed[0].rollback.is_empty());
    assert!(h.cluster.names_for(Verb::Delete).is_empty());
    assert_eq!(h.cluster.objects().len(), 2);
    let recs = h.store.list_instances("ns-1").unwrap();
    let state = |name: &str| recs.iter().find(|r| r.name == name).map(|r| r.ins_state);
    assert_eq!(state("C"), Some(InstanceState::UpdateSuccess));
    assert_eq!(state("D"), Some(InstanceState::UpdateFailed));
}

#[tokio::test]
async fn namespaces_are_independent() {
    let h = harness();
    h.cluster.fail(Verb::Create, "ConfigMap", "bad", || ReleaseError::Apply("denied".into()));
    let ok = NamespaceBundle::new("ns-2", "c1", "prod").with("configmap", spec("ConfigMap", "good"));
    let broken = NamespaceBundle::new("ns-1", "c1", "dev").with("configmap", spec("ConfigMap", "bad"));

    let res = h.inst.instantiate(&create(vec![broken, ok])).await;

    assert_eq!(
        serde_json::to_value(&res).unwrap(),
        json!({"success": [{"ns_id": "ns-2"}], "failed": [{"ns_id": "ns-1", "res_type": "configmap", "err_msg": "denied"}]})
    );
    assert!(h.cluster.object("ConfigMap", Some("prod"), "good").is_some());
}

#[tokio::test]
async fn bundle_from_yaml_applies_in_priority_order() {
    let h = harness();
    let yaml = r#"
apiVersion: apps/v1
kind: Deployment
metadata: {name: web}
---
apiVersion: v1
kind: ConfigMap
metadata: {name: settings}
---
apiVersion: v1
kind: Secret
metadata: {name: creds}
"#;
    let bundle = NamespaceBundle::from_yaml("ns-1", "c1", "dev", yaml, Default::default()).unwrap();
    let res = h.inst.instantiate(&create(vec![bundle])).await;
    assert!(res.is_success());
    assert_eq!(h.cluster.names_for(Verb::Create), vec!["creds", "settings", "web"]);
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use ufleet_api::{ControlPlane, CurInterface, ResourceController};
use ufleet_core::config::Config;
use ufleet_core::{Action, Kind, ObjectOptions, TenancyKey};
use ufleet_kubehub::fake::{FakeCluster, FakeConnector};
use ufleet_kubehub::{ClusterDescriptor, StaticResolver};
use ufleet_store::{HierarchicalStore, KvBackend, MemoryKv};

const SETTINGS: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  mode: fast\n";

fn desc(namespace: &str) -> ClusterDescriptor {
    ClusterDescriptor {
        cluster: "c1".into(),
        server: "https://c1.example:6443".into(),
        token: String::new(),
        ca_data: None,
        insecure: true,
        namespace: namespace.into(),
    }
}

fn config() -> Config {
    Config {
        kinds: vec![Kind::ConfigMap, Kind::Secret],
        watch_retry_ms: 20,
        request_timeout_secs: 2,
        cache_sync_timeout_secs: 2,
        event_queue_cap: 64,
        repair_secs: 3600,
        ..Config::default()
    }
}

async fn register_workspace(kv: &MemoryKv, id: &str, group: &str, name: &str) {
    let value = format!(r#"{{"group":"{}","name":"{}"}}"#, group, name);
    kv.create(&format!("/registry/workspaces/{}", id), Some(&value)).await.unwrap();
}

struct Env {
    kv: Arc<MemoryKv>,
    cluster: Arc<FakeCluster>,
    plane: ControlPlane,
}

/// One group with one workspace, a record stored by an earlier run and one
/// object created directly in the cluster.
async fn boot() -> Env {
    let kv = Arc::new(MemoryKv::default());
    kv.create("/registry/groups/g1", None).await.unwrap();
    register_workspace(&kv, "a", "g1", "w1").await;

    let earlier = HierarchicalStore::new(kv.clone(), "/ufleet", &[Kind::ConfigMap]);
    let kept = ufleet_core::ResourceMeta::managed(
        &TenancyKey::new("g1", "w1"),
        Kind::ConfigMap,
        "kept",
        &ObjectOptions::by("alice"),
        "{}".into(),
    );
    earlier.create_resource(Kind::ConfigMap, "g1", "w1", "kept", &kept.to_record().unwrap()).await.unwrap();

    let resolver = Arc::new(StaticResolver::new());
    resolver.set("g1", "w1", desc("ns-w1"));
    resolver.set("g1", "w2", desc("ns-w2"));
    let connector = FakeConnector::new();
    let cluster = connector.cluster("c1");
    cluster.insert_external(
        Kind::ConfigMap,
        "ns-w1",
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "legacy", "namespace": "ns-w1"}}),
    );

    let plane = ControlPlane::boot(config(), kv.clone(), resolver, connector).await.unwrap();
    Env { kv, cluster, plane }
}

async fn eventually<F, Fut>(mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn configmaps(e: &Env) -> Arc<dyn ResourceController> {
    e.plane.controllers().controller(Kind::ConfigMap).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boot_merges_store_and_cluster() {
    let e = boot().await;
    let ctl = configmaps(&e);

    let kept = ctl.get("g1", "w1", "kept").await.unwrap();
    assert!(!kept.memory_only);
    assert_eq!(kept.user, "alice");

    let c = ctl.clone();
    assert!(eventually(|| {
        let c = c.clone();
        async move { c.get("g1", "w1", "legacy").await.map(|m| m.memory_only).unwrap_or(false) }
    })
    .await);

    // registry sweep created the nodes for every configured kind
    assert_eq!(e.plane.store().list_workspaces(Kind::Secret, "g1").await.unwrap(), vec!["w1"]);
    assert!(e.plane.controllers().controller(Kind::Secret).unwrap().list_workspace("g1", "w1").await.unwrap().is_empty());
    assert_eq!(e.plane.controllers().kinds(), vec![Kind::ConfigMap, Kind::Secret]);
    assert!(e.plane.clusters().get_cluster("g1", "w1").await.unwrap().is_watching());
    e.plane.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_flow_through_the_registered_controller() {
    let e = boot().await;
    let mut apps = e.plane.take_app_events().unwrap();
    assert!(e.plane.take_app_events().is_none());
    let cur = e.plane.controllers().cur(Kind::ConfigMap).unwrap();

    let opts = ObjectOptions { app: "shop".into(), ..ObjectOptions::by("bob") };
    let meta = cur.create("g1", "w1", SETTINGS, &opts).await.unwrap();
    assert_eq!(meta.app, "shop");
    let live = e.cluster.object(Kind::ConfigMap, "ns-w1", "settings").unwrap();
    assert_eq!(live["data"]["mode"], "fast");
    assert!(cur.create("g1", "w1", SETTINGS, &opts).await.unwrap_err().is_already_exists());

    cur.delete("g1", "w1", "settings", &ObjectOptions::by("bob")).await.unwrap();
    assert!(e.cluster.object(Kind::ConfigMap, "ns-w1", "settings").is_none());
    assert!(configmaps(&e).get("g1", "w1", "settings").await.unwrap_err().is_not_found());

    let ev = apps.recv().await.unwrap();
    assert_eq!((ev.resource.as_str(), ev.app.as_str(), ev.action), ("settings", "shop", Action::Delete));

    // the trailing store events must not resurrect the deleted entry
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(configmaps(&e).get("g1", "w1", "settings").await.unwrap_err().is_not_found());
    e.plane.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workspaces_registered_at_runtime_become_usable() {
    let e = boot().await;
    register_workspace(&e.kv, "b", "g1", "w2").await;

    let ctl = configmaps(&e);
    let c = ctl.clone();
    assert!(eventually(|| {
        let c = c.clone();
        async move { c.list_workspace("g1", "w2").await.is_ok() }
    })
    .await);

    ctl.create("g1", "w2", SETTINGS, &ObjectOptions::by("carol")).await.unwrap();
    assert!(e.cluster.object(Kind::ConfigMap, "ns-w2", "settings").is_some());
    assert_eq!(e.plane.clusters().clusters().await.len(), 1);
    e.plane.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_controller_per_kind() {
    let e = boot().await;
    let m = e.plane.manager(Kind::ConfigMap).unwrap().clone();
    let err = e.plane.controllers().register_resource_controller(Kind::ConfigMap, m).unwrap_err();
    assert!(err.is_already_exists());
    assert!(e.plane.manager(Kind::Pod).is_none());
    e.plane.shutdown();
}

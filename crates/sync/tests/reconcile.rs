#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ufleet_core::{Action, Kind, TenancyKey};
use ufleet_kubehub::fake::FakeConnector;
use ufleet_kubehub::{ClusterDescriptor, ClusterRegistry, RegistrySettings, StaticResolver};
use ufleet_store::{HierarchicalStore, KvBackend, KvChange, MemoryKv};
use ufleet_sync::{ExternalRegistry, Reconciler};

const KINDS: [Kind; 2] = [Kind::ConfigMap, Kind::Pod];

struct Env {
    kv: Arc<MemoryKv>,
    store: Arc<HierarchicalStore>,
    registry: Arc<ClusterRegistry>,
    reconciler: Arc<Reconciler>,
}

fn env() -> Env {
    let kv = Arc::new(MemoryKv::default());
    let store = Arc::new(HierarchicalStore::new(kv.clone(), "/ufleet", &KINDS));
    let resolver = Arc::new(StaticResolver::new());
    for (g, w) in [("g1", "w1"), ("g1", "w2"), ("g2", "w1")] {
        resolver.set(
            g,
            w,
            ClusterDescriptor {
                cluster: "c1".into(),
                server: "https://c1".into(),
                token: String::new(),
                ca_data: None,
                insecure: true,
                namespace: format!("{}-{}", g, w),
            },
        );
    }
    let settings = RegistrySettings {
        kinds: KINDS.to_vec(),
        token: String::new(),
        watch_retry: Duration::from_millis(20),
        cache_sync_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        event_queue_cap: 64,
    };
    let registry = Arc::new(ClusterRegistry::new(resolver, FakeConnector::new(), settings));
    let external = ExternalRegistry::new(kv.clone(), "/registry/groups", "/registry/workspaces");
    let reconciler = Arc::new(Reconciler::new(external, store.clone(), registry.clone(), Duration::from_millis(20)));
    Env { kv, store, registry, reconciler }
}

async fn register_workspace(kv: &MemoryKv, id: &str, group: &str, name: &str) -> KvChange {
    let value = format!(r#"{{"group":"{}","name":"{}"}}"#, group, name);
    let key = format!("/registry/workspaces/{}", id);
    kv.create(&key, Some(&value)).await.unwrap();
    KvChange { action: Action::Create, key, value: Some(value), prev_value: None, dir: false }
}

fn group_change(action: Action, group: &str) -> KvChange {
    KvChange { action, key: format!("/registry/groups/{}", group), value: None, prev_value: None, dir: true }
}

#[tokio::test]
async fn second_sweep_changes_nothing() {
    let e = env();
    e.kv.create("/registry/groups/g1", None).await.unwrap();
    e.kv.create("/registry/groups/g2", None).await.unwrap();
    register_workspace(&e.kv, "a", "g1", "w1").await;
    register_workspace(&e.kv, "b", "g1", "w2").await;
    register_workspace(&e.kv, "c", "g2", "w1").await;
    // stale nodes the registries no longer list
    e.store.create_resource_workspace(Kind::Pod, "g1", "old").await.unwrap();
    e.store.create_resource_group(Kind::ConfigMap, "gone").await.unwrap();

    let first = e.reconciler.sweep().await.unwrap();
    // groups: ConfigMap +g1 +g2 -gone, Pod +g2 (g1 already implied by old)
    // workspaces: 3 created per kind, Pod -old
    assert_eq!(first, 11);
    assert_eq!(e.reconciler.sweep().await.unwrap(), 0);

    for kind in KINDS {
        assert_eq!(e.store.list_groups(kind).await.unwrap(), vec!["g1", "g2"]);
        assert_eq!(e.store.list_workspaces(kind, "g1").await.unwrap(), vec!["w1", "w2"]);
    }
}

#[tokio::test]
async fn attach_all_skips_workspaces_of_unknown_groups() {
    let e = env();
    e.kv.create("/registry/groups/g1", None).await.unwrap();
    register_workspace(&e.kv, "a", "g1", "w1").await;
    register_workspace(&e.kv, "b", "g1", "w2").await;
    register_workspace(&e.kv, "c", "g2", "w1").await;

    let attached = e.reconciler.attach_all().await.unwrap();
    assert_eq!(attached, vec![TenancyKey::new("g1", "w1"), TenancyKey::new("g1", "w2")]);
    let clusters = e.registry.clusters().await;
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].reference(), 2);
    assert!(!clusters[0].is_watching());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_changes_apply_at_runtime() {
    let e = env();
    let _tasks = e.reconciler.spawn();

    e.kv.create("/registry/groups/g1", None).await.unwrap();
    register_workspace(&e.kv, "a", "g1", "w1").await;

    let mut ready = false;
    for _ in 0..200 {
        let ws = e.store.list_workspaces(Kind::Pod, "g1").await.unwrap();
        if ws == vec!["w1"] {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready, "workspace nodes never appeared");
    let handle = e.registry.get_cluster("g1", "w1").await.unwrap();
    assert!(handle.is_watching());

    e.kv.delete("/registry/workspaces/a", false).await.unwrap();
    let mut detached = false;
    for _ in 0..200 {
        if e.registry.get_cluster("g1", "w1").await.is_err() {
            detached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(detached, "cluster never detached");
    assert!(e.store.list_workspaces(Kind::ConfigMap, "g1").await.unwrap().is_empty());

    e.kv.delete("/registry/groups/g1", false).await.unwrap();
    for _ in 0..200 {
        if e.store.list_groups(Kind::ConfigMap).await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("group nodes never removed");
}

#[tokio::test]
async fn unresolvable_workspace_still_gets_its_nodes() {
    let e = env();
    e.kv.create("/registry/groups/g1", None).await.unwrap();
    e.reconciler.sweep().await.unwrap();

    // no resolver entry for g1/wx: attaching fails, the nodes are created anyway
    let change = register_workspace(&e.kv, "x", "g1", "wx").await;
    e.reconciler.on_workspace_change(&change).await.unwrap();
    for kind in KINDS {
        assert_eq!(e.store.list_workspaces(kind, "g1").await.unwrap(), vec!["wx"]);
    }
    assert!(e.registry.get_cluster("g1", "wx").await.err().unwrap().is_not_found());
    assert_eq!(e.reconciler.sweep().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_removal_detaches_and_readdition_reattaches() {
    let e = env();
    e.kv.create("/registry/groups/g1", None).await.unwrap();
    register_workspace(&e.kv, "a", "g1", "w1").await;
    register_workspace(&e.kv, "b", "g1", "w2").await;
    e.reconciler.sweep().await.unwrap();
    assert_eq!(e.reconciler.attach_all().await.unwrap().len(), 2);

    e.kv.delete("/registry/groups/g1", false).await.unwrap();
    e.reconciler.on_group_change(&group_change(Action::Delete, "g1")).await.unwrap();
    assert!(e.registry.get_cluster("g1", "w1").await.err().unwrap().is_not_found());
    assert!(e.registry.get_cluster("g1", "w2").await.err().unwrap().is_not_found());
    assert!(e.registry.clusters().await.is_empty());
    assert!(e.store.list_groups(Kind::ConfigMap).await.unwrap().is_empty());

    // the workspace entries outlived their group and come back with it
    e.kv.create("/registry/groups/g1", None).await.unwrap();
    e.reconciler.on_group_change(&group_change(Action::Create, "g1")).await.unwrap();
    for kind in KINDS {
        assert_eq!(e.store.list_workspaces(kind, "g1").await.unwrap(), vec!["w1", "w2"]);
    }
    let handle = e.registry.get_cluster("g1", "w1").await.unwrap();
    assert_eq!(handle.reference(), 2);
    assert!(handle.is_watching());
    assert_eq!(e.reconciler.sweep().await.unwrap(), 0);
}

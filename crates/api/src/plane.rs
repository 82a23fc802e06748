//! Control plane bootstrap.
//!
//! Boot order:
//! 1. every kind's manager loads its tree from the store and registers as
//!    that kind's store event handler and controller;
//! 2. the store watcher subscribes;
//! 3. the registries are swept into the store (groups, then workspaces);
//! 4. every registered workspace is attached to its cluster;
//! 5. the managers start draining their cluster event queues and the
//!    watch caches start;
//! 6. the registry watch loops and repair loops start.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use metrics::{gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ufleet_core::config::Config;
use ufleet_core::{AppEvent, Kind};
use ufleet_kubehub::{ClusterConnector, ClusterRegistry, ConfigResolver, RegistrySettings};
use ufleet_manager::{AppNotifier, DefinitionLimits, ResourceManager};
use ufleet_store::{EventHandlerRegistry, HierarchicalStore, KvBackend, StoreWatcher};
use ufleet_sync::{ExternalRegistry, Reconciler};

use crate::controller::ControllerRegistry;

pub struct ControlPlane {
    config: Config,
    store: Arc<HierarchicalStore>,
    clusters: Arc<ClusterRegistry>,
    controllers: Arc<ControllerRegistry>,
    managers: BTreeMap<Kind, Arc<ResourceManager>>,
    reconciler: Arc<Reconciler>,
    apps: Mutex<Option<mpsc::UnboundedReceiver<AppEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Components shared by [`ControlPlane::boot`] and the one-shot commands.
pub fn assemble(
    config: &Config,
    kv: Arc<dyn KvBackend>,
    resolver: Arc<dyn ConfigResolver>,
    connector: Arc<dyn ClusterConnector>,
) -> (Arc<HierarchicalStore>, Arc<ClusterRegistry>, Arc<Reconciler>) {
    let store = Arc::new(HierarchicalStore::new(kv.clone(), &config.store_root, &config.kinds));
    let clusters = Arc::new(ClusterRegistry::new(resolver, connector, RegistrySettings::from_config(config)));
    let external = ExternalRegistry::new(kv, &config.group_registry, &config.workspace_registry);
    let reconciler = Arc::new(Reconciler::new(external, store.clone(), clusters.clone(), config.watch_retry()));
    (store, clusters, reconciler)
}

impl ControlPlane {
    pub async fn boot(
        config: Config,
        kv: Arc<dyn KvBackend>,
        resolver: Arc<dyn ConfigResolver>,
        connector: Arc<dyn ClusterConnector>,
    ) -> anyhow::Result<Self> {
        let started = Instant::now();
        let (store, clusters, reconciler) = assemble(&config, kv, resolver, connector);
        let handlers = Arc::new(EventHandlerRegistry::new(config.event_queue_cap));
        let controllers = Arc::new(ControllerRegistry::new());
        let (notifier, apps) = AppNotifier::channel();
        let limits = DefinitionLimits::from_config(&config);

        let mut managers = BTreeMap::new();
        for &kind in &config.kinds {
            store.ensure_kind(kind).await.with_context(|| format!("creating store directory for {}", kind))?;
            let m = ResourceManager::new(kind, store.clone(), clusters.clone(), notifier.clone(), limits);
            m.load().await.with_context(|| format!("loading {} tree", kind))?;
            handlers.register_event_handler(kind, m.clone())?;
            controllers.register_cur_interface(kind, m.clone())?;
            controllers.register_resource_controller(kind, m.clone())?;
            managers.insert(kind, m);
        }

        let mut tasks = vec![Arc::new(StoreWatcher::new(store.clone(), handlers, config.watch_retry())).spawn()];

        let mutations = reconciler.sweep().await.context("initial registry sweep")?;
        let attached = reconciler.attach_all().await.context("attaching workspaces")?;

        for m in managers.values() {
            match clusters.take_events(m.kind()) {
                Some(rx) => tasks.push(m.spawn_cluster_events(rx)),
                None => warn!(kind = %m.kind(), "cluster event queue already taken"),
            }
        }
        let watching = clusters.start_all_watches().await;

        tasks.extend(reconciler.spawn());
        for m in managers.values() {
            tasks.push(m.spawn_repair_loop(config.repair_interval()));
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("control_plane_boot_ms", elapsed_ms);
        gauge!("managed_kinds", managers.len() as f64);
        info!(
            kinds = managers.len(),
            mutations,
            workspaces = attached.len(),
            clusters = watching,
            elapsed_ms = elapsed_ms as u64,
            "control plane up"
        );
        Ok(Self {
            config,
            store,
            clusters,
            controllers,
            managers,
            reconciler,
            apps: Mutex::new(Some(apps)),
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<HierarchicalStore> {
        &self.store
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    pub fn controllers(&self) -> &Arc<ControllerRegistry> {
        &self.controllers
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn manager(&self, kind: Kind) -> Option<&Arc<ResourceManager>> {
        self.managers.get(&kind)
    }

    /// Application events emitted by the managers. Only the first caller
    /// gets the receiver.
    pub fn take_app_events(&self) -> Option<mpsc::UnboundedReceiver<AppEvent>> {
        self.apps.lock().ok()?.take()
    }

    /// Stop every background loop.
    pub fn shutdown(self) {
        for t in &self.tasks {
            t.abort();
        }
        info!(tasks = self.tasks.len(), "control plane stopped");
    }
}

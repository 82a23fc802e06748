//! Cluster Registry: tenancy pairs -> reference-counted cluster handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::gauge;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ufleet_core::{ClusterEvent, Error, Kind, Result, TenancyKey};

use crate::cache::{Bindings, CacheContext, EchoLedger, EventSinks, WatchCache};
use crate::client::{ClusterClient, ClusterConnector, ClusterDescriptor, ConfigResolver};
use crate::handler::KindHandler;

/// Connection to one physical cluster, shared by every tenancy pair it backs.
pub struct ClusterHandle {
    name: String,
    descriptor: ClusterDescriptor,
    client: Arc<dyn ClusterClient>,
    bindings: Arc<ArcSwap<Bindings>>,
    echo: Arc<EchoLedger>,
    cache: Mutex<Option<WatchCache>>,
    starts: AtomicU64,
    request_timeout: Duration,
}

impl ClusterHandle {
    fn new(descriptor: ClusterDescriptor, client: Arc<dyn ClusterClient>, request_timeout: Duration) -> Self {
        Self {
            name: descriptor.cluster.clone(),
            descriptor,
            client,
            bindings: Arc::new(ArcSwap::from_pointee(Bindings::new())),
            echo: Arc::new(EchoLedger::default()),
            cache: Mutex::new(None),
            starts: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    pub fn echo(&self) -> &Arc<EchoLedger> {
        &self.echo
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of tenancy pairs referencing this cluster.
    pub fn reference(&self) -> usize {
        self.bindings.load().len()
    }

    pub fn workspaces(&self) -> Vec<TenancyKey> {
        self.bindings.load().keys().cloned().collect()
    }

    pub fn namespace_for(&self, key: &TenancyKey) -> Option<String> {
        self.bindings.load().get(key).cloned()
    }

    /// How many times a watch cache has been started on this handle.
    pub fn watch_starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.cache.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Read an object from the watch cache; never touches the network.
    pub fn cached(&self, kind: Kind, namespace: &str, name: &str) -> Result<Option<Json>> {
        let guard = self.cache.lock().map_err(|_| Error::internal("watch cache lock poisoned"))?;
        let cache = guard.as_ref().ok_or_else(|| Error::upstream(format!("watch cache for {} not running", self.name)))?;
        Ok(cache.get(kind, namespace, name))
    }

    pub fn cached_list(&self, kind: Kind, namespace: &str) -> Result<Vec<Json>> {
        let guard = self.cache.lock().map_err(|_| Error::internal("watch cache lock poisoned"))?;
        let cache = guard.as_ref().ok_or_else(|| Error::upstream(format!("watch cache for {} not running", self.name)))?;
        Ok(cache.list(kind, namespace))
    }

    /// View of one kind in the namespace bound to `key`.
    pub fn handler(self: &Arc<Self>, key: &TenancyKey, kind: Kind) -> Result<KindHandler> {
        let namespace = self.namespace_for(key).ok_or_else(|| Error::not_found(format!("workspace {} on cluster {}", key, self.name)))?;
        Ok(KindHandler::new(self.clone(), kind, namespace))
    }

    fn bind(&self, key: TenancyKey, namespace: String) {
        self.bindings.rcu(|b| {
            let mut next = (**b).clone();
            next.insert(key.clone(), namespace.clone());
            next
        });
    }

    fn unbind(&self, key: &TenancyKey) {
        self.bindings.rcu(|b| {
            let mut next = (**b).clone();
            next.remove(key);
            next
        });
    }

    async fn start_watch(&self, kinds: &[Kind], sinks: EventSinks, settings: &RegistrySettings) -> Result<()> {
        if self.is_watching() {
            return Ok(());
        }
        self.echo.clear();
        let ctx = CacheContext {
            cluster: self.name.clone(),
            bindings: self.bindings.clone(),
            echo: self.echo.clone(),
            sinks,
            retry: settings.watch_retry,
        };
        let mut cache = WatchCache::start(self.client.clone(), kinds, ctx);
        if let Err(e) = cache.wait_synced(settings.cache_sync_timeout).await {
            cache.stop();
            return Err(e);
        }
        let mut slot = self.cache.lock().map_err(|_| Error::internal("watch cache lock poisoned"))?;
        *slot = Some(cache);
        self.starts.fetch_add(1, Ordering::SeqCst);
        info!(cluster = %self.name, "watch cache synced");
        Ok(())
    }

    fn stop_watch(&self) {
        if let Ok(mut slot) = self.cache.lock() {
            if let Some(mut cache) = slot.take() {
                cache.stop();
                info!(cluster = %self.name, "watch cache stopped");
            }
        }
        self.echo.clear();
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub kinds: Vec<Kind>,
    pub token: String,
    pub watch_retry: Duration,
    pub cache_sync_timeout: Duration,
    pub request_timeout: Duration,
    pub event_queue_cap: usize,
}

impl RegistrySettings {
    pub fn from_config(c: &ufleet_core::config::Config) -> Self {
        Self {
            kinds: c.kinds.clone(),
            token: c.resolver_token.clone(),
            watch_retry: c.watch_retry(),
            cache_sync_timeout: c.cache_sync_timeout(),
            request_timeout: c.request_timeout(),
            event_queue_cap: c.event_queue_cap,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    clusters: HashMap<String, Arc<ClusterHandle>>,
    tenancy: HashMap<TenancyKey, String>,
}

/// Owns every [`ClusterHandle`]. All mutations go through one registry-wide lock.
pub struct ClusterRegistry {
    resolver: Arc<dyn ConfigResolver>,
    connector: Arc<dyn ClusterConnector>,
    settings: RegistrySettings,
    state: tokio::sync::Mutex<RegistryState>,
    sinks: EventSinks,
    receivers: Mutex<HashMap<Kind, mpsc::Receiver<ClusterEvent>>>,
}

impl ClusterRegistry {
    pub fn new(resolver: Arc<dyn ConfigResolver>, connector: Arc<dyn ClusterConnector>, settings: RegistrySettings) -> Self {
        let (sinks, receivers) = EventSinks::new(&settings.kinds, settings.event_queue_cap);
        Self {
            resolver,
            connector,
            settings,
            state: tokio::sync::Mutex::new(RegistryState::default()),
            sinks,
            receivers: Mutex::new(receivers),
        }
    }

    pub fn kinds(&self) -> &[Kind] {
        &self.settings.kinds
    }

    /// Hand out the cluster event queue of a kind. Only the first caller gets it.
    pub fn take_events(&self, kind: Kind) -> Option<mpsc::Receiver<ClusterEvent>> {
        self.receivers.lock().ok()?.remove(&kind)
    }

    /// Attach `(group, workspace)` to the cluster its config resolves to.
    ///
    /// Joins an existing handle for the same physical cluster or connects a
    /// new one. With `start_watch`, the watch cache is started (and synced)
    /// if it is not running yet; a failed start detaches the pair again.
    /// A changed connection config restarts a running watch on the fresh
    /// handle; if that restart fails every pair on the cluster is detached.
    ///
    /// Resolving and connecting happen outside the registry lock; the
    /// registry is re-checked once the lock is taken.
    pub async fn create_or_update_cluster(&self, group: &str, workspace: &str, start_watch: bool) -> Result<Arc<ClusterHandle>> {
        let desc = self.resolver.resolve(group, workspace, &self.settings.token).await?;
        let key = TenancyKey::new(group, workspace);
        let reusable = {
            let st = self.state.lock().await;
            st.clusters.get(&desc.cluster).map(|h| h.descriptor.same_connection(&desc)).unwrap_or(false)
        };
        let mut client = if reusable { None } else { Some(self.connector.connect(&desc).await?) };

        let mut st = self.state.lock().await;
        if let Some(prev) = st.tenancy.get(&key).cloned() {
            if prev != desc.cluster {
                info!(tenancy = %key, from = %prev, to = %desc.cluster, "workspace moved to another cluster");
                self.detach_locked(&mut st, &key);
            }
        }

        let mut restart = false;
        let handle = match st.clusters.get(&desc.cluster).cloned() {
            Some(h) if h.descriptor.same_connection(&desc) => h,
            existing => {
                let client = match client.take() {
                    Some(c) => c,
                    // the handle went away while we were unlocked
                    None => self.connector.connect(&desc).await?,
                };
                match existing {
                    Some(h) => {
                        restart = h.is_watching();
                        self.replace_locked(&mut st, &h, &desc, client)
                    }
                    None => {
                        let h = Arc::new(ClusterHandle::new(desc.clone(), client, self.settings.request_timeout));
                        st.clusters.insert(desc.cluster.clone(), h.clone());
                        gauge!("cluster_handles", st.clusters.len() as f64);
                        info!(cluster = %desc.cluster, "cluster connected");
                        h
                    }
                }
            }
        };
        handle.bind(key.clone(), desc.namespace.clone());
        st.tenancy.insert(key.clone(), desc.cluster.clone());
        info!(tenancy = %key, cluster = %handle.name, reference = handle.reference(), "workspace attached");

        if start_watch || restart {
            if let Err(e) = handle.start_watch(&self.settings.kinds, self.sinks.clone(), &self.settings).await {
                if restart {
                    warn!(cluster = %handle.name, error = %e, "restarted watch cache failed to sync; detaching every workspace of the cluster");
                    for k in handle.workspaces() {
                        self.detach_locked(&mut st, &k);
                    }
                } else {
                    warn!(tenancy = %key, error = %e, "watch cache failed to start; detaching");
                    self.detach_locked(&mut st, &key);
                }
                return Err(e);
            }
        }
        Ok(handle)
    }

    pub async fn get_cluster(&self, group: &str, workspace: &str) -> Result<Arc<ClusterHandle>> {
        let st = self.state.lock().await;
        let key = TenancyKey::new(group, workspace);
        st.tenancy
            .get(&key)
            .and_then(|c| st.clusters.get(c))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("cluster for {}", key)))
    }

    /// Detach `(group, workspace)`; the handle is stopped and dropped with its last reference.
    pub async fn delete_cluster(&self, group: &str, workspace: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        let key = TenancyKey::new(group, workspace);
        if !st.tenancy.contains_key(&key) {
            return Err(Error::not_found(format!("cluster for {}", key)));
        }
        self.detach_locked(&mut st, &key);
        Ok(())
    }

    /// Start every attached cluster's watch cache. Clusters that fail to
    /// sync are detached entirely; returns how many caches were started.
    pub async fn start_all_watches(&self) -> usize {
        let mut st = self.state.lock().await;
        let handles: Vec<Arc<ClusterHandle>> = st.clusters.values().cloned().collect();
        let mut started = 0;
        for h in handles {
            if h.is_watching() {
                continue;
            }
            match h.start_watch(&self.settings.kinds, self.sinks.clone(), &self.settings).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(cluster = %h.name, error = %e, "watch cache failed to start; detaching its workspaces");
                    for key in h.workspaces() {
                        self.detach_locked(&mut st, &key);
                    }
                }
            }
        }
        started
    }

    /// Resolve the handler for a kind at call time.
    pub async fn handler(&self, group: &str, workspace: &str, kind: Kind) -> Result<KindHandler> {
        let handle = self.get_cluster(group, workspace).await?;
        handle.handler(&TenancyKey::new(group, workspace), kind)
    }

    pub async fn clusters(&self) -> Vec<Arc<ClusterHandle>> {
        let st = self.state.lock().await;
        let mut v: Vec<Arc<ClusterHandle>> = st.clusters.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    fn detach_locked(&self, st: &mut RegistryState, key: &TenancyKey) {
        let Some(cluster) = st.tenancy.remove(key) else { return };
        let Some(handle) = st.clusters.get(&cluster).cloned() else { return };
        handle.unbind(key);
        info!(tenancy = %key, %cluster, reference = handle.reference(), "workspace detached");
        if handle.reference() == 0 {
            handle.stop_watch();
            st.clusters.remove(&cluster);
            gauge!("cluster_handles", st.clusters.len() as f64);
            info!(%cluster, "cluster released");
        }
    }

    /// Swap in a fresh connection for a cluster whose connection config
    /// changed. The new handle keeps the bindings; its watch starts stopped.
    fn replace_locked(
        &self,
        st: &mut RegistryState,
        old: &Arc<ClusterHandle>,
        desc: &ClusterDescriptor,
        client: Arc<dyn ClusterClient>,
    ) -> Arc<ClusterHandle> {
        let fresh = Arc::new(ClusterHandle::new(desc.clone(), client, self.settings.request_timeout));
        fresh.bindings.store(old.bindings.load_full());
        old.stop_watch();
        st.clusters.insert(desc.cluster.clone(), fresh.clone());
        info!(cluster = %desc.cluster, "cluster connection replaced");
        fresh
    }
}

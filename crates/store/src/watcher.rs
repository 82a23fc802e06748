//! Store Watcher: one subscription on the store root, decoded into
//! [`ResourceEvent`]s and dispatched to the handler registered for each kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ufleet_core::{Error, Kind, ResourceEvent, Result};

use crate::hierarchy::HierarchicalStore;
use crate::kv::{KvChange, KvWatcher, WatchError};

/// Receives the store-sourced events of one kind, in watch order.
#[async_trait]
pub trait StoreEventHandler: Send + Sync {
    async fn handle(&self, event: ResourceEvent);

    /// Called after the watch dropped changes: rebuild whatever state the
    /// events maintain from the store itself.
    async fn resync(&self) {}
}

struct Registered {
    queue: mpsc::Sender<ResourceEvent>,
    handler: Arc<dyn StoreEventHandler>,
}

/// One handler per kind, each drained by its own consumer task through a
/// bounded queue.
pub struct EventHandlerRegistry {
    queue_cap: usize,
    handlers: Mutex<HashMap<Kind, Registered>>,
}

impl EventHandlerRegistry {
    pub fn new(queue_cap: usize) -> Self {
        Self { queue_cap: queue_cap.max(1), handlers: Mutex::new(HashMap::new()) }
    }

    /// Register the handler for `kind` and start its consumer task.
    /// A second registration for the same kind is rejected.
    pub fn register_event_handler(&self, kind: Kind, handler: Arc<dyn StoreEventHandler>) -> Result<()> {
        let mut handlers = self.handlers.lock().map_err(|_| Error::internal("handler registry lock poisoned"))?;
        if handlers.contains_key(&kind) {
            return Err(Error::already_exists(format!("event handler for {}", kind)));
        }
        let (tx, mut rx) = mpsc::channel::<ResourceEvent>(self.queue_cap);
        handlers.insert(kind, Registered { queue: tx, handler: handler.clone() });
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                handler.handle(ev).await;
            }
            debug!(%kind, "event handler queue closed");
        });
        info!(%kind, "event handler registered");
        Ok(())
    }

    /// Queue an event for its kind's handler. Returns false if nothing is
    /// registered for the kind; the event is dropped.
    pub async fn dispatch(&self, kind: Kind, event: ResourceEvent) -> bool {
        let tx = match self.handlers.lock() {
            Ok(h) => h.get(&kind).map(|r| r.queue.clone()),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Ask every registered handler to rebuild from the store. Returns how
    /// many were asked.
    pub async fn resync_all(&self) -> usize {
        let handlers: Vec<(Kind, Arc<dyn StoreEventHandler>)> = match self.handlers.lock() {
            Ok(h) => h.iter().map(|(k, r)| (*k, r.handler.clone())).collect(),
            Err(_) => return 0,
        };
        for (kind, h) in &handlers {
            debug!(%kind, "resyncing event handler");
            h.resync().await;
        }
        handlers.len()
    }
}

pub struct StoreWatcher {
    store: Arc<HierarchicalStore>,
    handlers: Arc<EventHandlerRegistry>,
    retry: Duration,
}

impl StoreWatcher {
    pub fn new(store: Arc<HierarchicalStore>, handlers: Arc<EventHandlerRegistry>, retry: Duration) -> Self {
        Self { store, handlers, retry }
    }

    /// Decode a raw change into its kind and tagged event.
    ///
    /// Changes to the root or a kind directory itself carry no tenancy and
    /// decode to `None`, as do keys under an unknown kind.
    pub fn decode(&self, change: &KvChange) -> Option<(Kind, ResourceEvent)> {
        let rest = change.key.strip_prefix(self.store.root())?;
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let (kind_seg, rest) = rest.split_once('/')?;
        let kind = match self.store.kind_for_segment(kind_seg) {
            Some(k) => k,
            None => {
                debug!(segment = %kind_seg, key = %change.key, "store watch: unknown kind segment");
                return None;
            }
        };
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        let action = change.action;
        let event = match parts.as_slice() {
            [group] if !group.is_empty() => ResourceEvent::Group { group: group.to_string(), action },
            [group, workspace] => {
                ResourceEvent::Workspace { group: group.to_string(), workspace: workspace.to_string(), action }
            }
            [group, workspace, name] if !change.dir => ResourceEvent::Resource {
                group: group.to_string(),
                workspace: workspace.to_string(),
                name: name.to_string(),
                value: change.value.clone(),
                action,
            },
            _ => return None,
        };
        Some((kind, event))
    }

    /// Subscribe now and run the dispatch loop in the background.
    ///
    /// The subscription exists when this returns, so changes made afterwards
    /// are never missed by the loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let watcher = self.store.kv().watch(self.store.root());
        tokio::spawn(async move { self.run(watcher).await })
    }

    async fn run(&self, mut watcher: KvWatcher) {
        info!(root = %self.store.root(), "store watcher started");
        loop {
            match watcher.next().await {
                Ok(change) => {
                    counter!("store_watch_events_total", 1);
                    let Some((kind, event)) = self.decode(&change) else { continue };
                    if !self.handlers.dispatch(kind, event).await {
                        debug!(%kind, key = %change.key, "store watch: no handler registered; dropped");
                    }
                }
                Err(WatchError::Lagged(n)) => {
                    counter!("store_watch_lagged_total", 1);
                    let resynced = self.handlers.resync_all().await;
                    warn!(missed = n, resynced, "store watch lagged; handlers resynced from the store");
                }
                Err(WatchError::Closed) => {
                    warn!("store watch closed; resubscribing");
                    tokio::time::sleep(self.retry).await;
                    watcher = self.store.kv().watch(self.store.root());
                    self.handlers.resync_all().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use ufleet_core::Action;

    fn watcher() -> StoreWatcher {
        let store = Arc::new(HierarchicalStore::new(Arc::new(MemoryKv::default()), "/ufleet", &[Kind::ConfigMap]));
        StoreWatcher::new(store, Arc::new(EventHandlerRegistry::new(8)), Duration::from_millis(10))
    }

    fn change(action: Action, key: &str, value: Option<&str>, dir: bool) -> KvChange {
        KvChange { action, key: key.into(), value: value.map(str::to_string), prev_value: None, dir }
    }

    #[test]
    fn decode_granularity() {
        let w = watcher();
        let (k, ev) = w.decode(&change(Action::Create, "/ufleet/ConfigMap/g1", None, true)).unwrap();
        assert_eq!(k, Kind::ConfigMap);
        assert_eq!(ev, ResourceEvent::Group { group: "g1".into(), action: Action::Create });

        let (_, ev) = w.decode(&change(Action::Delete, "/ufleet/ConfigMap/g1/w1", None, true)).unwrap();
        assert_eq!(ev, ResourceEvent::Workspace { group: "g1".into(), workspace: "w1".into(), action: Action::Delete });

        let (_, ev) = w.decode(&change(Action::Update, "/ufleet/ConfigMap/g1/w1/cfg", Some("v"), false)).unwrap();
        assert_eq!(
            ev,
            ResourceEvent::Resource {
                group: "g1".into(),
                workspace: "w1".into(),
                name: "cfg".into(),
                value: Some("v".into()),
                action: Action::Update
            }
        );
    }

    #[test]
    fn decode_ignores_roots_and_unknown_kinds() {
        let w = watcher();
        assert!(w.decode(&change(Action::Create, "/ufleet/ConfigMap", None, true)).is_none());
        assert!(w.decode(&change(Action::Create, "/ufleet/Widget/g1", None, true)).is_none());
        assert!(w.decode(&change(Action::Create, "/elsewhere/ConfigMap/g1", None, true)).is_none());
    }

    struct Nop;

    #[async_trait]
    impl StoreEventHandler for Nop {
        async fn handle(&self, _event: ResourceEvent) {}
    }

    #[derive(Default)]
    struct Counting {
        events: std::sync::atomic::AtomicUsize,
        resyncs: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl StoreEventHandler for Counting {
        async fn handle(&self, _event: ResourceEvent) {
            self.events.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        async fn resync(&self) {
            self.resyncs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn lagged_watch_resyncs_every_handler() {
        let kv = Arc::new(MemoryKv::new(16));
        let store = Arc::new(HierarchicalStore::new(kv, "/ufleet", &[Kind::ConfigMap]));
        let handlers = Arc::new(EventHandlerRegistry::new(256));
        let counting = Arc::new(Counting::default());
        handlers.register_event_handler(Kind::ConfigMap, counting.clone()).unwrap();
        let _task = Arc::new(StoreWatcher::new(store.clone(), handlers, Duration::from_millis(10))).spawn();

        // the single-threaded runtime does not run the watcher until we yield
        for i in 0..64 {
            store.create_resource_group(Kind::ConfigMap, &format!("g{}", i)).await.unwrap();
        }
        for _ in 0..100 {
            if counting.resyncs.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counting.resyncs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(counting.events.load(std::sync::atomic::Ordering::SeqCst) < 64);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let reg = EventHandlerRegistry::new(4);
        reg.register_event_handler(Kind::Pod, Arc::new(Nop)).unwrap();
        let e = reg.register_event_handler(Kind::Pod, Arc::new(Nop)).unwrap_err();
        assert!(e.is_already_exists());
        assert!(!reg.dispatch(Kind::Job, ResourceEvent::Group { group: "g".into(), action: Action::Create }).await);
    }
}

//! Watch cache: a locally maintained read copy of one cluster's objects,
//! fed by one list+watch task per kind, emitting [`ClusterEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ufleet_core::{Action, ClusterEvent, Error, Kind, Result, TenancyKey};

use crate::client::{object_name, object_namespace, strip_managed_fields, ClusterClient, WatchEvent};

/// Tenancy pairs bound to a cluster, with the namespace each one maps to.
pub type Bindings = BTreeMap<TenancyKey, String>;

type ObjKey = (String, String);

/// Writes issued by this system whose watch echo has not been seen yet.
///
/// An expectation is recorded before the write and withdrawn if the write
/// fails; the cache consumes it when the matching event arrives.
#[derive(Default)]
pub struct EchoLedger {
    pending: Mutex<HashMap<(Kind, String, String, Action), u32>>,
}

impl EchoLedger {
    pub fn expect(&self, kind: Kind, namespace: &str, name: &str, action: Action) {
        if let Ok(mut p) = self.pending.lock() {
            *p.entry((kind, namespace.to_string(), name.to_string(), action)).or_insert(0) += 1;
        }
    }

    pub fn withdraw(&self, kind: Kind, namespace: &str, name: &str, action: Action) {
        self.take(kind, namespace, name, action);
    }

    /// Consume one expectation. True if the event is an echo.
    pub fn take(&self, kind: Kind, namespace: &str, name: &str, action: Action) -> bool {
        let Ok(mut p) = self.pending.lock() else { return false };
        let key = (kind, namespace.to_string(), name.to_string(), action);
        match p.get_mut(&key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                p.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.values().map(|n| *n as usize).sum()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-kind bounded queues that carry cluster events to the kind's manager.
#[derive(Clone, Default)]
pub struct EventSinks {
    senders: Arc<HashMap<Kind, mpsc::Sender<ClusterEvent>>>,
}

impl EventSinks {
    /// Build one queue per kind, returning the receiving ends.
    pub fn new(kinds: &[Kind], cap: usize) -> (Self, HashMap<Kind, mpsc::Receiver<ClusterEvent>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in kinds {
            let (tx, rx) = mpsc::channel(cap.max(1));
            senders.insert(*kind, tx);
            receivers.insert(*kind, rx);
        }
        (Self { senders: Arc::new(senders) }, receivers)
    }

    async fn send(&self, ev: ClusterEvent) {
        if let Some(tx) = self.senders.get(&ev.kind) {
            if tx.send(ev).await.is_err() {
                debug!("cluster event receiver gone; dropped");
            }
        }
    }
}

/// Shared state a cache task needs to translate raw watch events.
#[derive(Clone)]
pub struct CacheContext {
    pub cluster: String,
    pub bindings: Arc<ArcSwap<Bindings>>,
    pub echo: Arc<EchoLedger>,
    pub sinks: EventSinks,
    pub retry: Duration,
}

type KindStore = RwLock<FxHashMap<ObjKey, Json>>;

pub struct WatchCache {
    stores: Arc<HashMap<Kind, KindStore>>,
    synced: Vec<(Kind, watch::Receiver<bool>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchCache {
    /// Spawn one list+watch task per kind. The cache is usable once
    /// [`WatchCache::wait_synced`] returns.
    pub fn start(client: Arc<dyn ClusterClient>, kinds: &[Kind], ctx: CacheContext) -> Self {
        let stores: Arc<HashMap<Kind, KindStore>> =
            Arc::new(kinds.iter().map(|k| (*k, RwLock::new(FxHashMap::default()))).collect());
        let mut synced = Vec::new();
        let mut tasks = Vec::new();
        for kind in kinds.iter().copied() {
            let (tx, rx) = watch::channel(false);
            synced.push((kind, rx));
            let client = client.clone();
            let stores = stores.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move { run_kind(kind, client, stores, ctx, tx).await }));
        }
        info!(cluster = %ctx.cluster, kinds = kinds.len(), "watch cache started");
        Self { stores, synced, tasks }
    }

    /// Wait until every kind has delivered its initial listing.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        let all = async {
            for (kind, rx) in &self.synced {
                let mut rx = rx.clone();
                let ok = rx.wait_for(|s| *s).await.is_ok();
                if !ok {
                    return Err(Error::upstream(format!("watch cache for {} stopped before sync", kind)));
                }
            }
            Ok(())
        };
        match tokio::time::timeout(timeout, all).await {
            Ok(res) => res,
            Err(_) => {
                let pending: Vec<String> =
                    self.synced.iter().filter(|(_, rx)| !*rx.borrow()).map(|(k, _)| k.to_string()).collect();
                Err(Error::upstream(format!("watch cache sync timed out for {}", pending.join(","))))
            }
        }
    }

    pub fn get(&self, kind: Kind, namespace: &str, name: &str) -> Option<Json> {
        let store = self.stores.get(&kind)?;
        let guard = store.read().ok()?;
        guard.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn list(&self, kind: Kind, namespace: &str) -> Vec<Json> {
        let Some(store) = self.stores.get(&kind) else { return Vec::new() };
        let Ok(guard) = store.read() else { return Vec::new() };
        let mut out: Vec<(&ObjKey, &Json)> = guard.iter().filter(|((ns, _), _)| ns == namespace).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn stop(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
        for store in self.stores.values() {
            if let Ok(mut s) = store.write() {
                s.clear();
            }
        }
    }
}

impl Drop for WatchCache {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

fn key_of(obj: &Json) -> Option<ObjKey> {
    Some((object_namespace(obj).unwrap_or_default().to_string(), object_name(obj)?.to_string()))
}

async fn run_kind(
    kind: Kind,
    client: Arc<dyn ClusterClient>,
    stores: Arc<HashMap<Kind, KindStore>>,
    ctx: CacheContext,
    synced: watch::Sender<bool>,
) {
    loop {
        let mut stream = client.watch(kind);
        debug!(cluster = %ctx.cluster, %kind, "watch stream opened");
        while let Some(item) = stream.next().await {
            match item {
                Ok(ev) => {
                    let restarted = matches!(ev, WatchEvent::Restarted(_));
                    let changes = apply(kind, &stores, ev);
                    if restarted {
                        let _ = synced.send(true);
                    }
                    emit(kind, &ctx, changes).await;
                }
                Err(e) => {
                    warn!(cluster = %ctx.cluster, %kind, error = %e, "watch error; retrying");
                    tokio::time::sleep(ctx.retry).await;
                }
            }
        }
        warn!(cluster = %ctx.cluster, %kind, "watch stream ended; reopening");
        tokio::time::sleep(ctx.retry).await;
    }
}

/// Apply a raw event to the kind store and return the resulting object changes.
fn apply(kind: Kind, stores: &HashMap<Kind, KindStore>, ev: WatchEvent) -> Vec<(Action, Json)> {
    let Some(store) = stores.get(&kind) else { return Vec::new() };
    let Ok(mut s) = store.write() else { return Vec::new() };
    let mut out = Vec::new();
    match ev {
        WatchEvent::Applied(mut obj) => {
            strip_managed_fields(&mut obj);
            if let Some(k) = key_of(&obj) {
                let action = if s.insert(k, obj.clone()).is_some() { Action::Update } else { Action::Create };
                out.push((action, obj));
            }
        }
        WatchEvent::Deleted(mut obj) => {
            strip_managed_fields(&mut obj);
            if let Some(k) = key_of(&obj) {
                s.remove(&k);
                out.push((Action::Delete, obj));
            }
        }
        WatchEvent::Restarted(list) => {
            let mut next: FxHashMap<ObjKey, Json> = FxHashMap::default();
            for mut obj in list {
                strip_managed_fields(&mut obj);
                if let Some(k) = key_of(&obj) {
                    next.insert(k, obj);
                }
            }
            for (k, obj) in next.iter() {
                match s.get(k) {
                    None => out.push((Action::Create, obj.clone())),
                    Some(prev) if prev != obj => out.push((Action::Update, obj.clone())),
                    Some(_) => {}
                }
            }
            for (k, obj) in s.iter() {
                if !next.contains_key(k) {
                    out.push((Action::Delete, obj.clone()));
                }
            }
            *s = next;
        }
    }
    out
}

async fn emit(kind: Kind, ctx: &CacheContext, changes: Vec<(Action, Json)>) {
    if changes.is_empty() {
        return;
    }
    let bindings = ctx.bindings.load_full();
    for (action, obj) in changes {
        let Some((ns, name)) = key_of(&obj) else { continue };
        let from_ufleet = ctx.echo.take(kind, &ns, &name, action);
        counter!("cluster_watch_events_total", 1, "kind" => kind.as_str());
        for (tenancy, bound_ns) in bindings.iter() {
            if *bound_ns != ns {
                continue;
            }
            let ev = ClusterEvent {
                kind,
                tenancy: tenancy.clone(),
                name: name.clone(),
                action,
                from_ufleet,
                object: obj.clone(),
            };
            ctx.sinks.send(ev).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(ns: &str, name: &str, v: i64) -> Json {
        serde_json::json!({ "metadata": { "namespace": ns, "name": name }, "data": { "v": v } })
    }

    #[test]
    fn echo_ledger_counts() {
        let l = EchoLedger::default();
        l.expect(Kind::Pod, "ns", "p", Action::Create);
        l.expect(Kind::Pod, "ns", "p", Action::Create);
        assert_eq!(l.len(), 2);
        assert!(l.take(Kind::Pod, "ns", "p", Action::Create));
        l.withdraw(Kind::Pod, "ns", "p", Action::Create);
        assert!(!l.take(Kind::Pod, "ns", "p", Action::Create));
        assert!(l.is_empty());
    }

    #[test]
    fn restart_diffs_against_previous_state() {
        let stores: HashMap<Kind, KindStore> = [(Kind::ConfigMap, RwLock::new(FxHashMap::default()))].into_iter().collect();
        let first = apply(Kind::ConfigMap, &stores, WatchEvent::Restarted(vec![obj("a", "x", 1), obj("a", "y", 1)]));
        assert_eq!(first.iter().filter(|(a, _)| *a == Action::Create).count(), 2);

        let second = apply(Kind::ConfigMap, &stores, WatchEvent::Restarted(vec![obj("a", "x", 2), obj("a", "z", 1)]));
        let mut actions: Vec<(Action, String)> =
            second.iter().map(|(a, o)| (*a, object_name(o).unwrap_or_default().to_string())).collect();
        actions.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            actions,
            vec![(Action::Update, "x".to_string()), (Action::Delete, "y".to_string()), (Action::Create, "z".to_string())]
        );

        let applied = apply(Kind::ConfigMap, &stores, WatchEvent::Applied(obj("a", "z", 5)));
        assert_eq!(applied[0].0, Action::Update);
    }
}

//! In-memory cluster with failure injection, used by tests across the workspace.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use ufleet_core::{Error, Kind, Result};

use crate::client::{object_name, ClusterClient, ClusterConnector, ClusterDescriptor, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Get,
    List,
    Create,
    Update,
    Delete,
}

type Objects = BTreeMap<(Kind, String, String), Json>;

pub struct FakeCluster {
    objects: Mutex<Objects>,
    feed: broadcast::Sender<(Kind, WatchEvent)>,
    failures: Mutex<Vec<(Kind, FakeOp, Error)>>,
    refuse_watch: AtomicBool,
    revision: AtomicU64,
    writes: AtomicU64,
    watch_opens: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(4096);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            feed,
            failures: Mutex::new(Vec::new()),
            refuse_watch: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            watch_opens: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ActiveWatch(Arc<AtomicUsize>);

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next matching call fail with `err`.
    pub fn fail_next(&self, kind: Kind, op: FakeOp, err: Error) {
        if let Ok(mut f) = self.failures.lock() {
            f.push((kind, op, err));
        }
    }

    /// Watches opened from now on report an error and never list.
    pub fn refuse_watches(&self, refuse: bool) {
        self.refuse_watch.store(refuse, Ordering::SeqCst);
    }

    /// Create or replace an object out of band, as another client would.
    pub fn insert_external(&self, kind: Kind, namespace: &str, object: Json) {
        let _ = self.put(kind, namespace, object, true);
    }

    pub fn remove_external(&self, kind: Kind, namespace: &str, name: &str) -> bool {
        self.remove(kind, namespace, name).is_ok()
    }

    pub fn object(&self, kind: Kind, namespace: &str, name: &str) -> Option<Json> {
        self.objects.lock().ok()?.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn names(&self, kind: Kind, namespace: &str) -> Vec<String> {
        let Ok(objects) = self.objects.lock() else { return Vec::new() };
        objects.keys().filter(|(k, ns, _)| *k == kind && ns == namespace).map(|(_, _, n)| n.clone()).collect()
    }

    /// Successful writes issued through the client interface.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn watch_opens(&self) -> u64 {
        self.watch_opens.load(Ordering::SeqCst)
    }

    pub fn active_watches(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn injected(&self, kind: Kind, op: FakeOp) -> Result<()> {
        let Ok(mut f) = self.failures.lock() else { return Ok(()) };
        match f.iter().position(|(k, o, _)| *k == kind && *o == op) {
            Some(i) => Err(f.remove(i).2),
            None => Ok(()),
        }
    }

    fn put(&self, kind: Kind, namespace: &str, mut object: Json, upsert: bool) -> Result<(Json, bool)> {
        let name = object_name(&object).ok_or_else(|| Error::invalid("object missing metadata.name"))?.to_string();
        let rv = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut objects = self.objects.lock().map_err(|_| Error::internal("fake cluster lock poisoned"))?;
        let key = (kind, namespace.to_string(), name.clone());
        let prev = objects.get(&key).cloned();
        if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
            meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            let created = prev
                .as_ref()
                .and_then(|p| p["metadata"].get("creationTimestamp").cloned())
                .unwrap_or_else(|| Json::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
            meta.insert("creationTimestamp".into(), created);
        }
        let existed = prev.is_some();
        if existed && !upsert {
            return Err(Error::already_exists(format!("{} {}/{}", kind, namespace, name)));
        }
        objects.insert(key, object.clone());
        let _ = self.feed.send((kind, WatchEvent::Applied(object.clone())));
        Ok((object, existed))
    }

    fn remove(&self, kind: Kind, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().map_err(|_| Error::internal("fake cluster lock poisoned"))?;
        match objects.remove(&(kind, namespace.to_string(), name.to_string())) {
            Some(obj) => {
                let _ = self.feed.send((kind, WatchEvent::Deleted(obj)));
                Ok(())
            }
            None => Err(Error::not_found(format!("{} {}/{}", kind, namespace, name))),
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<Option<Json>> {
        self.injected(kind, FakeOp::Get)?;
        Ok(self.object(kind, namespace, name))
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Json>> {
        self.injected(kind, FakeOp::List)?;
        let objects = self.objects.lock().map_err(|_| Error::internal("fake cluster lock poisoned"))?;
        Ok(objects.iter().filter(|((k, ns, _), _)| *k == kind && ns == namespace).map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json> {
        self.injected(kind, FakeOp::Create)?;
        let (obj, _) = self.put(kind, namespace, object.clone(), false)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn update(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json> {
        self.injected(kind, FakeOp::Update)?;
        let name = object_name(object).ok_or_else(|| Error::invalid("object missing metadata.name"))?;
        if self.object(kind, namespace, name).is_none() {
            return Err(Error::not_found(format!("{} {}/{}", kind, namespace, name)));
        }
        let (obj, _) = self.put(kind, namespace, object.clone(), true)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()> {
        self.injected(kind, FakeOp::Delete)?;
        self.remove(kind, namespace, name)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn watch(&self, kind: Kind) -> BoxStream<'static, Result<WatchEvent>> {
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_watch.load(Ordering::SeqCst) {
            return futures::stream::iter(vec![Err(Error::upstream("watch refused"))]).boxed();
        }
        // writes publish under the object lock, so the snapshot and the feed never overlap
        let (rx, initial) = match self.objects.lock() {
            Ok(objects) => {
                let initial: Vec<Json> = objects.iter().filter(|((k, _, _), _)| *k == kind).map(|(_, v)| v.clone()).collect();
                (self.feed.subscribe(), initial)
            }
            Err(_) => (self.feed.subscribe(), Vec::new()),
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveWatch(self.active.clone());
        let head = futures::stream::iter(vec![Ok(WatchEvent::Restarted(initial))]);
        let tail = futures::stream::unfold((rx, guard), move |(mut rx, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok((k, ev)) if k == kind => return Some((Ok(ev), (rx, guard))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        head.chain(tail).boxed()
    }
}

/// Hands out one [`FakeCluster`] per cluster name.
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
    connects: AtomicU64,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cluster(&self, name: &str) -> Arc<FakeCluster> {
        match self.clusters.lock() {
            Ok(mut c) => c.entry(name.to_string()).or_insert_with(FakeCluster::new).clone(),
            Err(_) => FakeCluster::new(),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, desc: &ClusterDescriptor) -> Result<Arc<dyn ClusterClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn ClusterClient> = self.cluster(&desc.cluster);
        Ok(client)
    }
}

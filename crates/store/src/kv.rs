//! Watchable tree-structured key-value store.
//!
//! Keys are absolute slash-separated paths. Nodes are either leaves carrying a
//! value or directories; creating a key creates any missing parent
//! directories. Every mutation is published on a change feed that watchers
//! filter by prefix.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use ufleet_core::{Action, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
}

impl KvNode {
    /// Last path segment.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// One mutation as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvChange {
    pub action: Action,
    pub key: String,
    pub value: Option<String>,
    pub prev_value: Option<String>,
    pub dir: bool,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvNode>>;
    /// Create a leaf (`Some(value)`) or a directory (`None`). `AlreadyExists` if present.
    async fn create(&self, key: &str, value: Option<&str>) -> Result<()>;
    /// Replace a leaf value. `NotFound` if absent.
    async fn update(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a node. Directories with children need `recursive`. `NotFound` if absent.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;
    /// Immediate children of a directory, sorted by key.
    async fn list(&self, dir: &str) -> Result<Vec<KvNode>>;
    /// Subscribe to changes at or below `prefix`.
    fn watch(&self, prefix: &str) -> KvWatcher;
}

/// Normalize to `/a/b/c`: leading slash, no trailing or doubled slashes.
pub fn normalize(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

pub fn join(parts: &[&str]) -> String {
    normalize(&parts.join("/"))
}

pub fn parent(key: &str) -> Option<&str> {
    if key == "/" {
        return None;
    }
    match key.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&key[..i]),
        None => None,
    }
}

fn is_under(key: &str, prefix: &str) -> bool {
    prefix == "/" || key == prefix || key.strip_prefix(prefix).map(|r| r.starts_with('/')).unwrap_or(false)
}

/// Broadcast fan-out of changes, shared by backends.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<KvChange>,
}

impl ChangeFeed {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(16));
        Self { tx }
    }

    pub fn publish(&self, change: KvChange) {
        // No receivers is fine
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self, prefix: &str) -> KvWatcher {
        KvWatcher { rx: self.tx.subscribe(), prefix: normalize(prefix) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Changes were dropped; the subscription keeps working.
    #[error("watch lagged by {0} changes")]
    Lagged(u64),
    /// The feed is gone; subscribe again.
    #[error("watch closed")]
    Closed,
}

impl From<WatchError> for Error {
    fn from(e: WatchError) -> Self {
        Error::upstream(e)
    }
}

/// A prefix-filtered subscription to a [`ChangeFeed`].
pub struct KvWatcher {
    rx: broadcast::Receiver<KvChange>,
    prefix: String,
}

impl KvWatcher {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next change under the prefix.
    pub async fn next(&mut self) -> std::result::Result<KvChange, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(change) if is_under(&change.key, &self.prefix) => return Ok(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(WatchError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
}

/// In-memory backend. Used in tests and for single-process deployments.
pub struct MemoryKv {
    nodes: RwLock<BTreeMap<String, Entry>>,
    feed: ChangeFeed,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl MemoryKv {
    pub fn new(watch_buffer: usize) -> Self {
        Self { nodes: RwLock::new(BTreeMap::new()), feed: ChangeFeed::new(watch_buffer) }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Entry>>> {
        self.nodes.read().map_err(|_| Error::internal("kv lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Entry>>> {
        self.nodes.write().map_err(|_| Error::internal("kv lock poisoned"))
    }

    fn children_of<'a>(nodes: &'a BTreeMap<String, Entry>, dir: &str) -> impl Iterator<Item = (&'a String, &'a Entry)> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let depth = prefix.len();
        nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| !k[depth..].contains('/'))
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvNode>> {
        let key = normalize(key);
        let nodes = self.read()?;
        Ok(nodes.get(&key).map(|e| KvNode { key: key.clone(), value: e.value.clone(), dir: e.dir }))
    }

    async fn create(&self, key: &str, value: Option<&str>) -> Result<()> {
        let key = normalize(key);
        if key == "/" {
            return Err(Error::already_exists("/"));
        }
        let mut nodes = self.write()?;
        if nodes.contains_key(&key) {
            return Err(Error::already_exists(&key));
        }
        // Implicit parents, checked before any insert
        let mut missing = Vec::new();
        let mut cur = parent(&key);
        while let Some(p) = cur {
            if p == "/" {
                break;
            }
            match nodes.get(p) {
                Some(e) if !e.dir => return Err(Error::invalid(format!("{} is not a directory", p))),
                Some(_) => break,
                None => missing.push(p.to_string()),
            }
            cur = parent(p);
        }
        let dir = value.is_none();
        nodes.insert(key.clone(), Entry { value: value.map(str::to_string), dir });
        // Implicit parents are announced outermost first, before the key itself
        for p in missing.into_iter().rev() {
            nodes.insert(p.clone(), Entry { value: None, dir: true });
            self.feed.publish(KvChange { action: Action::Create, key: p, value: None, prev_value: None, dir: true });
        }
        self.feed.publish(KvChange { action: Action::Create, key, value: value.map(str::to_string), prev_value: None, dir });
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        let key = normalize(key);
        let mut nodes = self.write()?;
        let entry = nodes.get_mut(&key).ok_or_else(|| Error::not_found(&key))?;
        if entry.dir {
            return Err(Error::invalid(format!("{} is a directory", key)));
        }
        let prev = entry.value.replace(value.to_string());
        self.feed.publish(KvChange { action: Action::Update, key, value: Some(value.to_string()), prev_value: prev, dir: false });
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = normalize(key);
        let mut nodes = self.write()?;
        let entry = nodes.get(&key).cloned().ok_or_else(|| Error::not_found(&key))?;
        if entry.dir {
            let below = format!("{}/", key);
            let doomed: Vec<String> = nodes.range(below.clone()..).take_while(|(k, _)| k.starts_with(&below)).map(|(k, _)| k.clone()).collect();
            if !doomed.is_empty() && !recursive {
                return Err(Error::invalid(format!("directory {} not empty", key)));
            }
            for k in doomed {
                nodes.remove(&k);
            }
        }
        nodes.remove(&key);
        self.feed.publish(KvChange { action: Action::Delete, key, value: None, prev_value: entry.value, dir: entry.dir });
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>> {
        let dir = normalize(dir);
        let nodes = self.read()?;
        if dir != "/" {
            match nodes.get(&dir) {
                None => return Err(Error::not_found(&dir)),
                Some(e) if !e.dir => return Err(Error::invalid(format!("{} is not a directory", dir))),
                Some(_) => {}
            }
        }
        Ok(Self::children_of(&nodes, &dir)
            .map(|(k, e)| KvNode { key: k.clone(), value: e.value.clone(), dir: e.dir })
            .collect())
    }

    fn watch(&self, prefix: &str) -> KvWatcher {
        self.feed.subscribe(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_and_parent() {
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(join(&["/root", "ConfigMap", "g1"]), "/root/ConfigMap/g1");
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert!(is_under("/a/b", "/a"));
        assert!(!is_under("/ab", "/a"));
    }

    #[tokio::test]
    async fn create_update_delete_semantics() {
        let kv = MemoryKv::default();
        kv.create("/r/k/g/w/x", Some("1")).await.unwrap();
        assert!(kv.create("/r/k/g/w/x", Some("2")).await.unwrap_err().is_already_exists());
        assert!(kv.get("/r/k/g").await.unwrap().unwrap().dir);
        kv.update("/r/k/g/w/x", "3").await.unwrap();
        assert_eq!(kv.get("/r/k/g/w/x").await.unwrap().unwrap().value.as_deref(), Some("3"));
        assert!(kv.update("/r/k/g/w/y", "1").await.unwrap_err().is_not_found());
        assert!(kv.delete("/r/k/g/w/y", false).await.unwrap_err().is_not_found());
        assert!(matches!(kv.delete("/r/k/g", false).await, Err(Error::Invalid(_))));
        kv.delete("/r/k/g", true).await.unwrap();
        assert!(kv.get("/r/k/g/w/x").await.unwrap().is_none());
        assert!(kv.list("/r/k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_immediate_children() {
        let kv = MemoryKv::default();
        kv.create("/d/a", None).await.unwrap();
        kv.create("/d/a/x", Some("v")).await.unwrap();
        kv.create("/d/b", Some("v")).await.unwrap();
        let names: Vec<String> = kv.list("/d").await.unwrap().iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(kv.list("/missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn watch_filters_by_prefix() {
        let kv = MemoryKv::default();
        let mut w = kv.watch("/r");
        kv.create("/other/x", Some("1")).await.unwrap();
        kv.create("/r/x", Some("1")).await.unwrap();
        kv.delete("/r/x", false).await.unwrap();
        let c1 = w.next().await.unwrap();
        assert_eq!((c1.action, c1.key.as_str()), (Action::Create, "/r/x"));
        let c2 = w.next().await.unwrap();
        assert_eq!(c2.action, Action::Delete);
        assert_eq!(c2.prev_value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn implicit_parents_are_announced() {
        let kv = MemoryKv::default();
        kv.create("/r", None).await.unwrap();
        let mut w = kv.watch("/r");
        kv.create("/r/k/g/w/x", Some("1")).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let c = w.next().await.unwrap();
            assert_eq!(c.action, Action::Create);
            seen.push((c.key, c.dir));
        }
        assert_eq!(
            seen,
            vec![
                ("/r/k".to_string(), true),
                ("/r/k/g".to_string(), true),
                ("/r/k/g/w".to_string(), true),
                ("/r/k/g/w/x".to_string(), false),
            ]
        );
    }
}

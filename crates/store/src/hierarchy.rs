//! Hierarchical Store: `<root>/<kind>/<group>/<workspace>/<name>` on top of a [`KvBackend`].

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use tracing::debug;
use ufleet_core::{Error, Kind, Result};

use crate::kv::{join, normalize, KvBackend};

/// Raw records of one kind: group -> workspace -> name -> record.
pub type KindTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

pub struct HierarchicalStore {
    kv: Arc<dyn KvBackend>,
    root: String,
    kinds: BTreeMap<Kind, String>,
}

impl HierarchicalStore {
    /// Each registered kind maps to a directory named after it.
    pub fn new(kv: Arc<dyn KvBackend>, root: &str, kinds: &[Kind]) -> Self {
        let kinds = kinds.iter().map(|k| (*k, k.as_str().to_string())).collect();
        Self { kv, root: normalize(root), kinds }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn kv(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    pub fn kinds(&self) -> Vec<Kind> {
        self.kinds.keys().copied().collect()
    }

    /// Reverse lookup used when decoding watch keys.
    pub fn kind_for_segment(&self, segment: &str) -> Option<Kind> {
        self.kinds.iter().find(|(_, dir)| dir.as_str() == segment).map(|(k, _)| *k)
    }

    fn kind_dir(&self, kind: Kind) -> Result<String> {
        let dir = self.kinds.get(&kind).ok_or_else(|| Error::invalid(format!("invalid kind: {}", kind)))?;
        Ok(join(&[&self.root, dir]))
    }

    pub fn group_key(&self, kind: Kind, group: &str) -> Result<String> {
        Ok(join(&[&self.kind_dir(kind)?, group]))
    }

    pub fn workspace_key(&self, kind: Kind, group: &str, workspace: &str) -> Result<String> {
        Ok(join(&[&self.kind_dir(kind)?, group, workspace]))
    }

    pub fn resource_key(&self, kind: Kind, group: &str, workspace: &str, name: &str) -> Result<String> {
        Ok(join(&[&self.kind_dir(kind)?, group, workspace, name]))
    }

    /// Create the kind directory if missing. Idempotent.
    pub async fn ensure_kind(&self, kind: Kind) -> Result<()> {
        match self.kv.create(&self.kind_dir(kind)?, None).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    pub async fn create_resource(&self, kind: Kind, group: &str, workspace: &str, name: &str, value: &str) -> Result<()> {
        let key = self.resource_key(kind, group, workspace, name)?;
        counter!("store_ops_total", 1, "op" => "create");
        debug!(%key, "store: create resource");
        self.kv.create(&key, Some(value)).await
    }

    pub async fn update_resource(&self, kind: Kind, group: &str, workspace: &str, name: &str, value: &str) -> Result<()> {
        let key = self.resource_key(kind, group, workspace, name)?;
        counter!("store_ops_total", 1, "op" => "update");
        debug!(%key, "store: update resource");
        self.kv.update(&key, value).await
    }

    pub async fn delete_resource(&self, kind: Kind, group: &str, workspace: &str, name: &str) -> Result<()> {
        let key = self.resource_key(kind, group, workspace, name)?;
        counter!("store_ops_total", 1, "op" => "delete");
        debug!(%key, "store: delete resource");
        self.kv.delete(&key, false).await
    }

    pub async fn get_resource(&self, kind: Kind, group: &str, workspace: &str, name: &str) -> Result<String> {
        let key = self.resource_key(kind, group, workspace, name)?;
        match self.kv.get(&key).await? {
            Some(node) if !node.dir => node.value.ok_or_else(|| Error::not_found(&key)),
            _ => Err(Error::not_found(&key)),
        }
    }

    pub async fn create_resource_group(&self, kind: Kind, group: &str) -> Result<()> {
        let key = self.group_key(kind, group)?;
        counter!("store_ops_total", 1, "op" => "create_group");
        self.kv.create(&key, None).await
    }

    pub async fn delete_resource_group(&self, kind: Kind, group: &str) -> Result<()> {
        let key = self.group_key(kind, group)?;
        counter!("store_ops_total", 1, "op" => "delete_group");
        self.kv.delete(&key, true).await
    }

    pub async fn create_resource_workspace(&self, kind: Kind, group: &str, workspace: &str) -> Result<()> {
        let key = self.workspace_key(kind, group, workspace)?;
        counter!("store_ops_total", 1, "op" => "create_workspace");
        self.kv.create(&key, None).await
    }

    pub async fn delete_resource_workspace(&self, kind: Kind, group: &str, workspace: &str) -> Result<()> {
        let key = self.workspace_key(kind, group, workspace)?;
        counter!("store_ops_total", 1, "op" => "delete_workspace");
        self.kv.delete(&key, true).await
    }

    /// Group names present for a kind. A missing kind directory is an empty list.
    pub async fn list_groups(&self, kind: Kind) -> Result<Vec<String>> {
        let dir = self.kind_dir(kind)?;
        self.list_dir_names(&dir).await
    }

    pub async fn list_workspaces(&self, kind: Kind, group: &str) -> Result<Vec<String>> {
        let dir = self.group_key(kind, group)?;
        self.list_dir_names(&dir).await
    }

    async fn list_dir_names(&self, dir: &str) -> Result<Vec<String>> {
        match self.kv.list(dir).await {
            Ok(nodes) => Ok(nodes.into_iter().filter(|n| n.dir).map(|n| n.name().to_string()).collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Full tree of one kind including empty group and workspace nodes.
    pub async fn get_resource_all_group(&self, kind: Kind) -> Result<KindTree> {
        let mut tree = KindTree::new();
        for group in self.list_groups(kind).await? {
            let mut workspaces = BTreeMap::new();
            for ws in self.list_workspaces(kind, &group).await? {
                let mut records = BTreeMap::new();
                let dir = self.workspace_key(kind, &group, &ws)?;
                let nodes = match self.kv.list(&dir).await {
                    Ok(nodes) => nodes,
                    // Removed between listing and reading
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                for node in nodes.into_iter().filter(|n| !n.dir) {
                    if let Some(value) = node.value.clone() {
                        records.insert(node.name().to_string(), value);
                    }
                }
                workspaces.insert(ws, records);
            }
            tree.insert(group, workspaces);
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> HierarchicalStore {
        HierarchicalStore::new(Arc::new(MemoryKv::default()), "/ufleet", &[Kind::ConfigMap, Kind::Pod])
    }

    #[tokio::test]
    async fn keys_are_deterministic() {
        let s = store();
        assert_eq!(s.resource_key(Kind::ConfigMap, "g1", "w1", "cfg1").unwrap(), "/ufleet/ConfigMap/g1/w1/cfg1");
        assert_eq!(s.kind_for_segment("Pod"), Some(Kind::Pod));
        assert_eq!(s.kind_for_segment("Job"), None);
    }

    #[tokio::test]
    async fn unregistered_kind_fails_fast() {
        let s = store();
        let e = s.create_resource(Kind::Job, "g", "w", "n", "{}").await.unwrap_err();
        assert!(matches!(e, Error::Invalid(ref m) if m.contains("invalid kind")), "e={}", e);
    }

    #[tokio::test]
    async fn expected_outcomes() {
        let s = store();
        s.create_resource(Kind::ConfigMap, "g", "w", "a", "1").await.unwrap();
        assert!(s.create_resource(Kind::ConfigMap, "g", "w", "a", "1").await.unwrap_err().is_already_exists());
        assert!(s.update_resource(Kind::ConfigMap, "g", "w", "b", "1").await.unwrap_err().is_not_found());
        assert!(s.delete_resource(Kind::ConfigMap, "g", "w", "b").await.unwrap_err().is_not_found());
        assert!(s.get_resource(Kind::ConfigMap, "g", "w", "b").await.unwrap_err().is_not_found());
        assert_eq!(s.get_resource(Kind::ConfigMap, "g", "w", "a").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn all_group_includes_empty_nodes() {
        let s = store();
        s.create_resource_group(Kind::Pod, "empty").await.unwrap();
        s.create_resource_workspace(Kind::Pod, "g", "idle").await.unwrap();
        s.create_resource(Kind::Pod, "g", "busy", "p1", "x").await.unwrap();
        let tree = s.get_resource_all_group(Kind::Pod).await.unwrap();
        assert!(tree["empty"].is_empty());
        assert!(tree["g"]["idle"].is_empty());
        assert_eq!(tree["g"]["busy"]["p1"], "x");
        assert!(s.get_resource_all_group(Kind::ConfigMap).await.unwrap().is_empty());
    }
}

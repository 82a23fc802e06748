//! Group -> Workspace -> Resource tree held by each manager.

use std::collections::BTreeMap;

use tracing::warn;
use ufleet_core::{Error, Kind, ResourceMeta, Result};
use ufleet_store::KindTree;

pub type Workspace = BTreeMap<String, ResourceMeta>;

#[derive(Debug, Default, Clone)]
pub struct Tree {
    groups: BTreeMap<String, BTreeMap<String, Workspace>>,
}

impl Tree {
    /// Decode a kind's stored tree. Undecodable records are skipped and counted.
    pub fn from_store(kind: Kind, stored: KindTree) -> (Self, usize) {
        let mut tree = Tree::default();
        let mut skipped = 0;
        for (group, workspaces) in stored {
            let g = tree.groups.entry(group.clone()).or_default();
            for (workspace, records) in workspaces {
                let w = g.entry(workspace.clone()).or_default();
                for (name, raw) in records {
                    match ResourceMeta::from_record(&raw) {
                        Ok(meta) => {
                            w.insert(name, meta);
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(%kind, %group, %workspace, %name, error = %e, "skipping undecodable record");
                        }
                    }
                }
            }
        }
        (tree, skipped)
    }

    pub fn groups(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn has_workspace(&self, group: &str, workspace: &str) -> bool {
        self.groups.get(group).map(|g| g.contains_key(workspace)).unwrap_or(false)
    }

    pub fn ensure_group(&mut self, group: &str) -> bool {
        if self.groups.contains_key(group) {
            return false;
        }
        self.groups.insert(group.to_string(), BTreeMap::new());
        true
    }

    pub fn remove_group(&mut self, group: &str) -> bool {
        self.groups.remove(group).is_some()
    }

    pub fn ensure_workspace(&mut self, group: &str, workspace: &str) -> &mut Workspace {
        self.groups.entry(group.to_string()).or_default().entry(workspace.to_string()).or_default()
    }

    pub fn remove_workspace(&mut self, group: &str, workspace: &str) -> bool {
        self.groups.get_mut(group).map(|g| g.remove(workspace).is_some()).unwrap_or(false)
    }

    pub fn group(&self, group: &str) -> Result<&BTreeMap<String, Workspace>> {
        self.groups.get(group).ok_or_else(|| Error::not_found(format!("group {}", group)))
    }

    pub fn workspace(&self, group: &str, workspace: &str) -> Result<&Workspace> {
        self.group(group)?
            .get(workspace)
            .ok_or_else(|| Error::not_found(format!("workspace {}/{}", group, workspace)))
    }

    pub fn workspace_mut(&mut self, group: &str, workspace: &str) -> Result<&mut Workspace> {
        self.groups
            .get_mut(group)
            .and_then(|g| g.get_mut(workspace))
            .ok_or_else(|| Error::not_found(format!("workspace {}/{}", group, workspace)))
    }

    pub fn get(&self, group: &str, workspace: &str, name: &str) -> Result<&ResourceMeta> {
        self.workspace(group, workspace)?
            .get(name)
            .ok_or_else(|| Error::not_found(format!("{}/{}/{}", group, workspace, name)))
    }

    /// Insert into an existing workspace; false if the workspace is unknown.
    pub fn insert(&mut self, meta: ResourceMeta) -> bool {
        match self.groups.get_mut(&meta.group).and_then(|g| g.get_mut(&meta.workspace)) {
            Some(w) => {
                w.insert(meta.name.clone(), meta);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, group: &str, workspace: &str, name: &str) -> Option<ResourceMeta> {
        self.groups.get_mut(group)?.get_mut(workspace)?.remove(name)
    }

    pub fn workspace_keys(&self) -> Vec<(String, String)> {
        self.groups.iter().flat_map(|(g, ws)| ws.keys().map(move |w| (g.clone(), w.clone()))).collect()
    }

    /// Move `old`'s cluster-only entries into workspaces this tree still
    /// has, without shadowing entries already here. Returns how many moved.
    pub fn carry_memory_only(&mut self, old: Tree) -> usize {
        let mut carried = 0;
        for (group, workspaces) in old.groups {
            for (workspace, entries) in workspaces {
                let Ok(target) = self.workspace_mut(&group, &workspace) else { continue };
                for (name, meta) in entries.into_iter().filter(|(_, m)| m.memory_only) {
                    if !target.contains_key(&name) {
                        target.insert(name, meta);
                        carried += 1;
                    }
                }
            }
        }
        carried
    }

    pub fn len(&self) -> usize {
        self.groups.values().flat_map(|g| g.values()).map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufleet_core::{ObjectOptions, TenancyKey};

    #[test]
    fn load_skips_corrupt_records() {
        let key = TenancyKey::new("g1", "w1");
        let good = ResourceMeta::managed(&key, Kind::Pod, "p1", &ObjectOptions::by("alice"), "{}".into());
        let mut stored = KindTree::new();
        let ws = stored.entry("g1".into()).or_default().entry("w1".into()).or_default();
        ws.insert("p1".into(), good.to_record().unwrap());
        ws.insert("p2".into(), "not json".into());
        stored.entry("g2".into()).or_default();

        let (tree, skipped) = Tree::from_store(Kind::Pod, stored);
        assert_eq!(skipped, 1);
        assert_eq!(tree.len(), 1);
        assert!(tree.has_group("g2"));
        assert_eq!(tree.get("g1", "w1", "p1").unwrap().user, "alice");
        assert!(tree.get("g1", "w1", "p2").unwrap_err().is_not_found());
        assert!(tree.workspace("g2", "w1").unwrap_err().is_not_found());
    }

    #[test]
    fn cluster_only_entries_survive_a_reload() {
        let w1 = TenancyKey::new("g1", "w1");
        let gone = TenancyKey::new("g1", "gone");
        let mut old = Tree::default();
        old.ensure_workspace("g1", "w1");
        old.ensure_workspace("g1", "gone");
        old.insert(ResourceMeta::memory_only(&w1, Kind::Pod, "live", "", None));
        old.insert(ResourceMeta::memory_only(&w1, Kind::Pod, "p1", "", None));
        old.insert(ResourceMeta::memory_only(&gone, Kind::Pod, "orphan", "", None));
        old.insert(ResourceMeta::managed(&w1, Kind::Pod, "dropped", &ObjectOptions::by("bob"), "{}".into()));

        let mut stored = KindTree::new();
        let record = ResourceMeta::managed(&w1, Kind::Pod, "p1", &ObjectOptions::by("alice"), "{}".into());
        stored.entry("g1".into()).or_default().entry("w1".into()).or_default().insert("p1".into(), record.to_record().unwrap());
        let (mut fresh, _) = Tree::from_store(Kind::Pod, stored);

        assert_eq!(fresh.carry_memory_only(old), 1);
        assert!(fresh.get("g1", "w1", "live").unwrap().memory_only);
        assert_eq!(fresh.get("g1", "w1", "p1").unwrap().user, "alice");
        assert!(fresh.get("g1", "w1", "dropped").unwrap_err().is_not_found());
        assert!(!fresh.has_workspace("g1", "gone"));
        assert_eq!(fresh.workspace_keys(), vec![("g1".to_string(), "w1".to_string())]);
    }
}

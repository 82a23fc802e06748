//! Read side of the externally owned group and workspace registries.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use ufleet_core::{Error, Result, TenancyKey};
use ufleet_store::kv::{normalize, parent};
use ufleet_store::{KvBackend, KvChange, KvWatcher};

/// Entry of the workspace registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub group: String,
    pub name: String,
}

impl WorkspaceRecord {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::invalid(format!("workspace record: {}", e)))
    }

    pub fn key(&self) -> TenancyKey {
        TenancyKey::new(self.group.clone(), self.name.clone())
    }
}

pub struct ExternalRegistry {
    kv: Arc<dyn KvBackend>,
    groups_dir: String,
    workspaces_dir: String,
}

impl ExternalRegistry {
    pub fn new(kv: Arc<dyn KvBackend>, groups_dir: &str, workspaces_dir: &str) -> Self {
        Self { kv, groups_dir: normalize(groups_dir), workspaces_dir: normalize(workspaces_dir) }
    }

    pub fn groups_dir(&self) -> &str {
        &self.groups_dir
    }

    pub fn workspaces_dir(&self) -> &str {
        &self.workspaces_dir
    }

    /// Group names. A registry directory that does not exist yet is empty.
    pub async fn groups(&self) -> Result<BTreeSet<String>> {
        match self.kv.list(&self.groups_dir).await {
            Ok(nodes) => Ok(nodes.iter().map(|n| n.name().to_string()).collect()),
            Err(e) if e.is_not_found() => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    /// Workspace pairs. Undecodable entries are skipped.
    pub async fn workspaces(&self) -> Result<BTreeSet<TenancyKey>> {
        let nodes = match self.kv.list(&self.workspaces_dir).await {
            Ok(nodes) => nodes,
            Err(e) if e.is_not_found() => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        let mut out = BTreeSet::new();
        for node in nodes.iter().filter(|n| !n.dir) {
            match node.value.as_deref().map(WorkspaceRecord::decode) {
                Some(Ok(rec)) => {
                    out.insert(rec.key());
                }
                Some(Err(e)) => warn!(key = %node.key, error = %e, "skipping workspace registry entry"),
                None => {}
            }
        }
        Ok(out)
    }

    pub fn watch_groups(&self) -> KvWatcher {
        self.kv.watch(&self.groups_dir)
    }

    pub fn watch_workspaces(&self) -> KvWatcher {
        self.kv.watch(&self.workspaces_dir)
    }

    /// Group named by a change directly below the group registry.
    pub fn group_of(&self, change: &KvChange) -> Option<String> {
        if parent(&change.key) != Some(self.groups_dir.as_str()) {
            return None;
        }
        change.key.rsplit('/').next().map(str::to_string)
    }

    /// Workspace record carried by a change directly below the workspace registry.
    pub fn workspace_of(&self, change: &KvChange) -> Option<WorkspaceRecord> {
        if parent(&change.key) != Some(self.workspaces_dir.as_str()) || change.dir {
            return None;
        }
        let raw = change.value.as_deref().or(change.prev_value.as_deref())?;
        match WorkspaceRecord::decode(raw) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!(key = %change.key, error = %e, "undecodable workspace registry change");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufleet_core::Action;
    use ufleet_store::MemoryKv;

    #[tokio::test]
    async fn reads_both_registries() {
        let kv = Arc::new(MemoryKv::default());
        let reg = ExternalRegistry::new(kv.clone(), "/registry/groups", "/registry/workspaces");
        assert!(reg.groups().await.unwrap().is_empty());
        kv.create("/registry/groups/g1", None).await.unwrap();
        kv.create("/registry/groups/g2", Some("{}")).await.unwrap();
        kv.create("/registry/workspaces/a", Some(r#"{"group":"g1","name":"w1"}"#)).await.unwrap();
        kv.create("/registry/workspaces/b", Some("garbage")).await.unwrap();

        let groups: Vec<String> = reg.groups().await.unwrap().into_iter().collect();
        assert_eq!(groups, vec!["g1", "g2"]);
        let ws: Vec<TenancyKey> = reg.workspaces().await.unwrap().into_iter().collect();
        assert_eq!(ws, vec![TenancyKey::new("g1", "w1")]);
    }

    #[test]
    fn change_decoding() {
        let reg = ExternalRegistry::new(Arc::new(MemoryKv::default()), "/registry/groups", "/registry/workspaces");
        let ch = |key: &str, value: Option<&str>, prev: Option<&str>| KvChange {
            action: Action::Delete,
            key: key.into(),
            value: value.map(str::to_string),
            prev_value: prev.map(str::to_string),
            dir: false,
        };
        assert_eq!(reg.group_of(&ch("/registry/groups/g1", None, None)).as_deref(), Some("g1"));
        assert_eq!(reg.group_of(&ch("/registry/groups", None, None)), None);
        assert_eq!(reg.group_of(&ch("/registry/groups/g1/x", None, None)), None);
        let rec = reg.workspace_of(&ch("/registry/workspaces/a", None, Some(r#"{"group":"g1","name":"w1"}"#))).unwrap();
        assert_eq!(rec.key(), TenancyKey::new("g1", "w1"));
    }
}

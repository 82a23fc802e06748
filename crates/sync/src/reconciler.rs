//! External Registry Reconciler.
//!
//! Forces the store's group and workspace nodes, for every kind, to match
//! the external registries: once as a sweep, then per registry change.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ufleet_core::error::ignore_idempotent;
use ufleet_core::{Action, Result, TenancyKey};
use ufleet_kubehub::ClusterRegistry;
use ufleet_store::{HierarchicalStore, KvChange, KvWatcher, WatchError};

use crate::registry::ExternalRegistry;

pub struct Reconciler {
    external: ExternalRegistry,
    store: Arc<HierarchicalStore>,
    clusters: Arc<ClusterRegistry>,
    retry: Duration,
}

fn mutated(op: &'static str) {
    counter!("reconcile_mutations_total", 1, "op" => op);
}

impl Reconciler {
    pub fn new(external: ExternalRegistry, store: Arc<HierarchicalStore>, clusters: Arc<ClusterRegistry>, retry: Duration) -> Self {
        Self { external, store, clusters, retry }
    }

    pub fn external(&self) -> &ExternalRegistry {
        &self.external
    }

    /// Make every kind's group nodes equal the group registry. Returns the
    /// number of store mutations.
    pub async fn sync_groups(&self) -> Result<usize> {
        let wanted = self.external.groups().await?;
        let mut n = 0;
        for kind in self.store.kinds() {
            let have: BTreeSet<String> = self.store.list_groups(kind).await?.into_iter().collect();
            for group in wanted.difference(&have) {
                if ignore_idempotent(self.store.create_resource_group(kind, group).await)? {
                    mutated("create_group");
                    n += 1;
                }
            }
            for group in have.difference(&wanted) {
                if ignore_idempotent(self.store.delete_resource_group(kind, group).await)? {
                    mutated("delete_group");
                    n += 1;
                }
            }
        }
        info!(mutations = n, groups = wanted.len(), "group sweep done");
        Ok(n)
    }

    /// Make every kind's workspace nodes equal the workspace registry.
    /// Expects the group nodes to be in place already.
    pub async fn sync_workspaces(&self) -> Result<usize> {
        let wanted = self.external.workspaces().await?;
        let mut n = 0;
        for kind in self.store.kinds() {
            for group in self.store.list_groups(kind).await? {
                let have: BTreeSet<String> = self.store.list_workspaces(kind, &group).await?.into_iter().collect();
                let want: BTreeSet<String> =
                    wanted.iter().filter(|k| k.group == group).map(|k| k.workspace.clone()).collect();
                for ws in want.difference(&have) {
                    if ignore_idempotent(self.store.create_resource_workspace(kind, &group, ws).await)? {
                        mutated("create_workspace");
                        n += 1;
                    }
                }
                for ws in have.difference(&want) {
                    if ignore_idempotent(self.store.delete_resource_workspace(kind, &group, ws).await)? {
                        mutated("delete_workspace");
                        n += 1;
                    }
                }
            }
        }
        info!(mutations = n, workspaces = wanted.len(), "workspace sweep done");
        Ok(n)
    }

    /// Groups first, then workspaces.
    pub async fn sweep(&self) -> Result<usize> {
        Ok(self.sync_groups().await? + self.sync_workspaces().await?)
    }

    /// Attach every registered workspace of a known group to its cluster
    /// without starting watches. Failures are logged and skipped.
    pub async fn attach_all(&self) -> Result<Vec<TenancyKey>> {
        let groups = self.external.groups().await?;
        let mut attached = Vec::new();
        for key in self.external.workspaces().await? {
            if !groups.contains(&key.group) {
                warn!(tenancy = %key, "workspace of unknown group; not attached");
                continue;
            }
            match self.clusters.create_or_update_cluster(&key.group, &key.workspace, false).await {
                Ok(h) => {
                    debug!(tenancy = %key, cluster = %h.name(), "workspace attached");
                    attached.push(key);
                }
                Err(e) => warn!(tenancy = %key, error = %e, "attaching workspace failed"),
            }
        }
        Ok(attached)
    }

    /// Attach a workspace's cluster, starting its watch. Failures are logged;
    /// the workspace stays usable in the store without a cluster.
    async fn attach(&self, key: &TenancyKey) -> bool {
        match self.clusters.create_or_update_cluster(&key.group, &key.workspace, true).await {
            Ok(h) => {
                debug!(tenancy = %key, cluster = %h.name(), "workspace attached");
                true
            }
            Err(e) => {
                warn!(tenancy = %key, error = %e, "attaching workspace failed; nodes created without a cluster");
                false
            }
        }
    }

    async fn create_workspace_nodes(&self, key: &TenancyKey) -> Result<()> {
        for kind in self.store.kinds() {
            if ignore_idempotent(self.store.create_resource_workspace(kind, &key.group, &key.workspace).await)? {
                mutated("create_workspace");
            }
        }
        Ok(())
    }

    /// Apply one group registry change to every kind. A new group picks up
    /// the workspaces already registered for it; a removed group detaches
    /// every workspace of it.
    pub async fn on_group_change(&self, change: &KvChange) -> Result<()> {
        let Some(group) = self.external.group_of(change) else { return Ok(()) };
        for kind in self.store.kinds() {
            let res = match change.action {
                Action::Create => self.store.create_resource_group(kind, &group).await,
                Action::Delete => self.store.delete_resource_group(kind, &group).await,
                Action::Update => continue,
            };
            if ignore_idempotent(res)? {
                mutated(if change.action == Action::Create { "create_group" } else { "delete_group" });
            }
        }
        match change.action {
            Action::Create => {
                for key in self.external.workspaces().await?.into_iter().filter(|k| k.group == group) {
                    self.attach(&key).await;
                    self.create_workspace_nodes(&key).await?;
                }
            }
            Action::Delete => {
                let mut attached = BTreeSet::new();
                for h in self.clusters.clusters().await {
                    attached.extend(h.workspaces().into_iter().filter(|k| k.group == group));
                }
                for key in attached {
                    if ignore_idempotent(self.clusters.delete_cluster(&key.group, &key.workspace).await)? {
                        debug!(tenancy = %key, "workspace detached with its group");
                    }
                }
            }
            Action::Update => {}
        }
        info!(%group, action = ?change.action, "group registry change applied");
        Ok(())
    }

    /// Apply one workspace registry change: attach (or re-resolve) the
    /// cluster, then create the workspace nodes whether or not that worked.
    /// On removal the nodes go before the cluster is detached.
    pub async fn on_workspace_change(&self, change: &KvChange) -> Result<()> {
        let Some(rec) = self.external.workspace_of(change) else { return Ok(()) };
        let key = rec.key();
        match change.action {
            Action::Create | Action::Update => {
                if !self.external.groups().await?.contains(&rec.group) {
                    warn!(group = %rec.group, workspace = %rec.name, "workspace of unknown group; ignored");
                    return Ok(());
                }
                self.attach(&key).await;
                self.create_workspace_nodes(&key).await?;
            }
            Action::Delete => {
                for kind in self.store.kinds() {
                    if ignore_idempotent(self.store.delete_resource_workspace(kind, &rec.group, &rec.name).await)? {
                        mutated("delete_workspace");
                    }
                }
                ignore_idempotent(self.clusters.delete_cluster(&rec.group, &rec.name).await)?;
            }
        }
        info!(group = %rec.group, workspace = %rec.name, action = ?change.action, "workspace registry change applied");
        Ok(())
    }

    /// Subscribe to both registries now and run their loops in the background.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let groups = self.external.watch_groups();
        let workspaces = self.external.watch_workspaces();
        let g = self.clone();
        let w = self.clone();
        vec![
            tokio::spawn(async move { g.run(groups, Feed::Groups).await }),
            tokio::spawn(async move { w.run(workspaces, Feed::Workspaces).await }),
        ]
    }

    async fn run(&self, mut watcher: KvWatcher, feed: Feed) {
        info!(prefix = %watcher.prefix(), "registry watch started");
        loop {
            match watcher.next().await {
                Ok(change) => {
                    let res = match feed {
                        Feed::Groups => self.on_group_change(&change).await,
                        Feed::Workspaces => self.on_workspace_change(&change).await,
                    };
                    if let Err(e) = res {
                        warn!(key = %change.key, error = %e, "registry change not applied");
                    }
                }
                Err(WatchError::Lagged(missed)) => {
                    warn!(missed, prefix = %watcher.prefix(), "registry watch lagged; resweeping");
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "resweep failed");
                    }
                }
                Err(WatchError::Closed) => {
                    warn!(prefix = %watcher.prefix(), "registry watch closed; resubscribing");
                    tokio::time::sleep(self.retry).await;
                    watcher = match feed {
                        Feed::Groups => self.external.watch_groups(),
                        Feed::Workspaces => self.external.watch_workspaces(),
                    };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    Groups,
    Workspaces,
}

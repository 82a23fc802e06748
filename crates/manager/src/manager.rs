//! Generic per-kind Resource Manager.
//!
//! Holds the kind's Group -> Workspace -> Resource tree behind one lock and
//! merges three sources into it: the store at boot, store watch events and
//! cluster watch events. Writes go to the store first and the cluster
//! second, with the store write compensated if the cluster rejects it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ufleet_core::error::ignore_idempotent;
use ufleet_core::{
    Action, AppEvent, ClusterEvent, Error, Kind, ObjectOptions, ResourceEvent, ResourceMeta, Result, TenancyKey,
};
use ufleet_kubehub::client::{object_app, object_meta, object_name};
use ufleet_kubehub::{ClusterRegistry, KindHandler};
use ufleet_store::{HierarchicalStore, StoreEventHandler};

use crate::definition::{parse_definition, strip_noisy, DefinitionLimits};
use crate::notify::AppNotifier;
use crate::repair::{Divergence, Inconsistency, RepairReport};
use crate::tree::Tree;

pub struct ResourceManager {
    kind: Kind,
    store: Arc<HierarchicalStore>,
    clusters: Arc<ClusterRegistry>,
    notifier: AppNotifier,
    limits: DefinitionLimits,
    tree: Mutex<Tree>,
    pending: std::sync::Mutex<Vec<Inconsistency>>,
}

/// Metadata for an object found in the cluster but not created here.
fn discovered(key: &TenancyKey, kind: Kind, obj: &Json) -> Option<ResourceMeta> {
    let name = object_name(obj)?;
    let created = object_meta(obj).ok().and_then(|m| m.creation_timestamp).map(|t| t.0);
    Some(ResourceMeta::memory_only(key, kind, name, &object_app(obj), created))
}

impl ResourceManager {
    pub fn new(
        kind: Kind,
        store: Arc<HierarchicalStore>,
        clusters: Arc<ClusterRegistry>,
        notifier: AppNotifier,
        limits: DefinitionLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            store,
            clusters,
            notifier,
            limits,
            tree: Mutex::new(Tree::default()),
            pending: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Replace the tree with the kind's stored records. No cluster calls.
    pub async fn load(&self) -> Result<usize> {
        let stored = self.store.get_resource_all_group(self.kind).await?;
        let (tree, skipped) = Tree::from_store(self.kind, stored);
        let loaded = tree.len();
        *self.tree.lock().await = tree;
        info!(kind = %self.kind, loaded, skipped, "resource tree loaded");
        Ok(loaded)
    }

    async fn handler(&self, group: &str, workspace: &str) -> Result<KindHandler> {
        self.clusters.handler(group, workspace, self.kind).await
    }

    fn record(&self, item: Inconsistency) {
        error!(kind = %self.kind, %item, "store and cluster diverged; queued for repair");
        counter!("manager_rollback_failures_total", 1, "kind" => self.kind.as_str());
        if let Ok(mut p) = self.pending.lock() {
            p.push(item);
        }
    }

    pub async fn create_object(&self, group: &str, workspace: &str, raw: &str, opts: &ObjectOptions) -> Result<ResourceMeta> {
        let def = parse_definition(raw, self.kind, &self.limits)?;
        let mut tree = self.tree.lock().await;
        if tree.workspace(group, workspace)?.contains_key(&def.name) {
            return Err(Error::already_exists(format!("{} {}/{}/{}", self.kind, group, workspace, def.name)));
        }
        let handler = self.handler(group, workspace).await?;
        let object = def.prepare(handler.namespace(), &opts.app);
        let template = serde_json::to_string(&object).map_err(|e| Error::internal(format!("encoding template: {}", e)))?;
        let key = TenancyKey::new(group, workspace);
        let meta = ResourceMeta::managed(&key, self.kind, &def.name, opts, template);

        self.store.create_resource(self.kind, group, workspace, &def.name, &meta.to_record()?).await?;
        if let Err(e) = handler.create(&object).await {
            counter!("manager_rollbacks_total", 1, "kind" => self.kind.as_str(), "op" => "create");
            warn!(kind = %self.kind, %group, %workspace, name = %def.name, error = %e, "cluster create failed; removing record");
            if let Err(re) = ignore_idempotent(self.store.delete_resource(self.kind, group, workspace, &def.name).await) {
                error!(kind = %self.kind, name = %def.name, error = %re, "record rollback failed");
                self.record(Inconsistency::new(key, &def.name, Divergence::OrphanRecord));
            }
            return Err(e);
        }
        tree.insert(meta.clone());
        info!(kind = %self.kind, %group, %workspace, name = %def.name, user = %opts.user, "object created");
        Ok(meta)
    }

    pub async fn update_object(
        &self,
        group: &str,
        workspace: &str,
        name: &str,
        raw: &str,
        opts: &ObjectOptions,
    ) -> Result<ResourceMeta> {
        let def = parse_definition(raw, self.kind, &self.limits)?;
        if def.name != name {
            return Err(Error::invalid(format!("definition names {}, expected {}", def.name, name)));
        }
        let mut tree = self.tree.lock().await;
        let current = tree.get(group, workspace, name)?.clone();
        let handler = self.handler(group, workspace).await?;
        let app = if opts.app.is_empty() { current.app.clone() } else { opts.app.clone() };
        let object = def.prepare(handler.namespace(), &app);

        if current.memory_only {
            handler.update(&object).await?;
            info!(kind = %self.kind, %group, %workspace, %name, "cluster-only object updated");
            return Ok(current);
        }

        let mut next = current.clone();
        next.template = serde_json::to_string(&object).map_err(|e| Error::internal(format!("encoding template: {}", e)))?;
        next.app = app;
        if !opts.comment.is_empty() {
            next.comment = opts.comment.clone();
        }
        let previous = current.to_record()?;
        self.store.update_resource(self.kind, group, workspace, name, &next.to_record()?).await?;
        if let Err(e) = handler.update(&object).await {
            counter!("manager_rollbacks_total", 1, "kind" => self.kind.as_str(), "op" => "update");
            warn!(kind = %self.kind, %group, %workspace, %name, error = %e, "cluster update failed; restoring record");
            if let Err(re) = self.store.update_resource(self.kind, group, workspace, name, &previous).await {
                error!(kind = %self.kind, %name, error = %re, "record restore failed");
                self.record(Inconsistency::new(current.tenancy(), name, Divergence::StaleRecord { previous }));
            }
            return Err(e);
        }
        tree.insert(next.clone());
        info!(kind = %self.kind, %group, %workspace, %name, "object updated");
        Ok(next)
    }

    /// Delete an object. Absent objects are always NotFound; a cluster
    /// NotFound after the lookup counts as already deleted.
    pub async fn delete_object(&self, group: &str, workspace: &str, name: &str, opts: &ObjectOptions) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let current = tree.get(group, workspace, name)?.clone();
        let handler = self.handler(group, workspace).await?;

        if current.memory_only {
            if !ignore_idempotent(handler.delete(name).await)? {
                debug!(kind = %self.kind, %name, "cluster object already gone");
            }
        } else {
            let previous = current.to_record()?;
            if !ignore_idempotent(self.store.delete_resource(self.kind, group, workspace, name).await)? {
                warn!(kind = %self.kind, %group, %workspace, %name, "record already missing from store");
            }
            if let Err(e) = ignore_idempotent(handler.delete(name).await) {
                counter!("manager_rollbacks_total", 1, "kind" => self.kind.as_str(), "op" => "delete");
                warn!(kind = %self.kind, %group, %workspace, %name, error = %e, "cluster delete failed; restoring record");
                if let Err(re) = ignore_idempotent(self.store.create_resource(self.kind, group, workspace, name, &previous).await) {
                    error!(kind = %self.kind, %name, error = %re, "record restore failed");
                    self.record(Inconsistency::new(current.tenancy(), name, Divergence::MissingRecord { previous }));
                }
                return Err(e);
            }
        }
        tree.remove(group, workspace, name);
        info!(kind = %self.kind, %group, %workspace, %name, memory_only = current.memory_only, "object deleted");

        if current.has_app() && !opts.suppress_app_event {
            self.notifier.notify(AppEvent {
                group: group.to_string(),
                workspace: workspace.to_string(),
                resource: name.to_string(),
                kind: self.kind,
                action: Action::Delete,
                app: current.app.clone(),
            });
        }
        Ok(())
    }

    pub async fn list_group_object(&self, group: &str) -> Result<Vec<ResourceMeta>> {
        let tree = self.tree.lock().await;
        Ok(tree.group(group)?.values().flat_map(|w| w.values().cloned()).collect())
    }

    pub async fn list_group_workspace_object(&self, group: &str, workspace: &str) -> Result<Vec<ResourceMeta>> {
        let tree = self.tree.lock().await;
        Ok(tree.workspace(group, workspace)?.values().cloned().collect())
    }

    pub async fn get_object(&self, group: &str, workspace: &str, name: &str) -> Result<ResourceMeta> {
        let tree = self.tree.lock().await;
        tree.get(group, workspace, name).cloned()
    }

    /// Stored template, or a serialized view of the live object for cluster-only entries.
    pub async fn get_object_template(&self, group: &str, workspace: &str, name: &str) -> Result<String> {
        let meta = self.get_object(group, workspace, name).await?;
        if !meta.memory_only {
            return Ok(meta.template);
        }
        let handler = self.handler(group, workspace).await?;
        let live = match handler.get(name) {
            Ok(Some(obj)) => Some(obj),
            _ => handler.get_live(name).await?,
        };
        let obj = live.ok_or_else(|| Error::not_found(format!("{} {}/{}/{} in cluster", self.kind, group, workspace, name)))?;
        serde_json::to_string(&strip_noisy(obj)).map_err(|e| Error::internal(format!("encoding template: {}", e)))
    }

    /// Attach a workspace and adopt the objects already living in its
    /// namespace as cluster-only entries. Returns how many were added.
    pub async fn add_workspace(&self, group: &str, workspace: &str) -> Result<usize> {
        let mut tree = self.tree.lock().await;
        tree.ensure_workspace(group, workspace);
        let handler = self.handler(group, workspace).await?;
        let objects = handler.list_live().await?;
        let key = TenancyKey::new(group, workspace);
        let entries = tree.workspace_mut(group, workspace)?;
        let mut added = 0;
        for obj in &objects {
            let Some(meta) = discovered(&key, self.kind, obj) else { continue };
            if entries.contains_key(&meta.name) {
                continue;
            }
            entries.insert(meta.name.clone(), meta);
            added += 1;
        }
        info!(kind = %self.kind, %group, %workspace, listed = objects.len(), added, "workspace attached");
        Ok(added)
    }

    /// Apply one cluster watch event. Echoes of our own writes are ignored.
    pub async fn handle_cluster_event(&self, ev: ClusterEvent) {
        if ev.kind != self.kind {
            return;
        }
        if ev.from_ufleet {
            debug!(kind = %self.kind, tenancy = %ev.tenancy, name = %ev.name, action = ?ev.action, "ignoring echo");
            return;
        }
        let TenancyKey { group, workspace } = &ev.tenancy;
        let mut tree = self.tree.lock().await;
        match ev.action {
            Action::Create => {
                let Ok(entries) = tree.workspace_mut(group, workspace) else {
                    debug!(kind = %self.kind, tenancy = %ev.tenancy, name = %ev.name, "workspace not attached; event skipped");
                    return;
                };
                if entries.contains_key(&ev.name) {
                    return;
                }
                if let Some(meta) = discovered(&ev.tenancy, self.kind, &ev.object) {
                    entries.insert(meta.name.clone(), meta);
                    info!(kind = %self.kind, tenancy = %ev.tenancy, name = %ev.name, "cluster-only object tracked");
                }
            }
            Action::Delete => {
                let Some(meta) = tree.remove(group, workspace, &ev.name) else { return };
                info!(kind = %self.kind, tenancy = %ev.tenancy, name = %ev.name, memory_only = meta.memory_only, "object removed from cluster");
                if meta.memory_only {
                    return;
                }
                // deleted out of band: the record must go with it or the name stays taken
                if let Err(e) = ignore_idempotent(self.store.delete_resource(self.kind, group, workspace, &ev.name).await) {
                    error!(kind = %self.kind, tenancy = %ev.tenancy, name = %ev.name, error = %e, "dropping record of vanished object failed");
                    self.record(Inconsistency::new(ev.tenancy.clone(), &ev.name, Divergence::OrphanRecord));
                }
            }
            Action::Update => {}
        }
    }

    /// Drain the kind's cluster event queue until it closes.
    pub fn spawn_cluster_events(self: &Arc<Self>, mut rx: mpsc::Receiver<ClusterEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                this.handle_cluster_event(ev).await;
            }
            debug!(kind = %this.kind, "cluster event queue closed");
        })
    }

    pub fn inconsistencies(&self) -> Vec<Inconsistency> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Retry every recorded divergence against the current cluster state.
    pub async fn repair(&self) -> RepairReport {
        let mut tree = self.tree.lock().await;
        let items: Vec<Inconsistency> = match self.pending.lock() {
            Ok(mut p) => p.drain(..).collect(),
            Err(_) => return RepairReport::default(),
        };
        if items.is_empty() {
            return RepairReport::default();
        }
        let mut remaining = Vec::new();
        let mut repaired = 0;
        for mut item in items {
            match self.repair_one(&mut tree, &item).await {
                Ok(()) => {
                    repaired += 1;
                    info!(kind = %self.kind, %item, "divergence repaired");
                }
                Err(e) => {
                    item.attempts += 1;
                    warn!(kind = %self.kind, %item, attempts = item.attempts, error = %e, "repair failed; will retry");
                    remaining.push(item);
                }
            }
        }
        let report = RepairReport { repaired, remaining: remaining.len() };
        if let Ok(mut p) = self.pending.lock() {
            p.extend(remaining);
        }
        report
    }

    async fn repair_one(&self, tree: &mut Tree, item: &Inconsistency) -> Result<()> {
        let (group, workspace, name) = (&item.tenancy.group, &item.tenancy.workspace, &item.name);
        match &item.divergence {
            Divergence::OrphanRecord => {
                let handler = self.handler(group, workspace).await?;
                if handler.get_live(name).await?.is_some() {
                    // the create landed after all: adopt the record
                    let raw = self.store.get_resource(self.kind, group, workspace, name).await?;
                    tree.ensure_workspace(group, workspace);
                    tree.insert(ResourceMeta::from_record(&raw)?);
                } else {
                    ignore_idempotent(self.store.delete_resource(self.kind, group, workspace, name).await)?;
                }
            }
            Divergence::StaleRecord { previous } => {
                match self.store.update_resource(self.kind, group, workspace, name, previous).await {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                }
            }
            Divergence::MissingRecord { previous } => {
                let handler = self.handler(group, workspace).await?;
                if handler.get_live(name).await?.is_some() {
                    ignore_idempotent(self.store.create_resource(self.kind, group, workspace, name, previous).await)?;
                } else {
                    tree.remove(group, workspace, name);
                }
            }
        }
        Ok(())
    }

    /// Run [`ResourceManager::repair`] every `every`.
    pub fn spawn_repair_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = this.repair().await;
                if report.repaired > 0 || report.remaining > 0 {
                    info!(kind = %this.kind, repaired = report.repaired, remaining = report.remaining, "repair pass");
                }
            }
        })
    }
}

#[async_trait]
impl StoreEventHandler for ResourceManager {
    async fn handle(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Group { group, action: Action::Create } => {
                if self.tree.lock().await.ensure_group(&group) {
                    debug!(kind = %self.kind, %group, "group added");
                }
            }
            ResourceEvent::Group { group, action: Action::Delete } => {
                if self.tree.lock().await.remove_group(&group) {
                    info!(kind = %self.kind, %group, "group removed");
                }
            }
            ResourceEvent::Workspace { group, workspace, action: Action::Create } => {
                match self.add_workspace(&group, &workspace).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(kind = %self.kind, %group, %workspace, "no cluster attached yet; workspace tracked empty")
                    }
                    Err(e) => warn!(kind = %self.kind, %group, %workspace, error = %e, "listing workspace objects failed"),
                }
            }
            ResourceEvent::Workspace { group, workspace, action: Action::Delete } => {
                if self.tree.lock().await.remove_workspace(&group, &workspace) {
                    info!(kind = %self.kind, %group, %workspace, "workspace removed");
                }
            }
            ResourceEvent::Resource { group, workspace, name, value: Some(_), action: Action::Create | Action::Update } => {
                // events trail the writes; the record under the lock is authoritative
                let mut tree = self.tree.lock().await;
                let raw = match self.store.get_resource(self.kind, &group, &workspace, &name).await {
                    Ok(raw) => raw,
                    Err(e) if e.is_not_found() => {
                        debug!(kind = %self.kind, %group, %workspace, %name, "record gone before its event; skipped");
                        return;
                    }
                    Err(e) => {
                        warn!(kind = %self.kind, %group, %workspace, %name, error = %e, "reading record failed");
                        return;
                    }
                };
                match ResourceMeta::from_record(&raw) {
                    Ok(meta) => {
                        tree.ensure_workspace(&group, &workspace);
                        tree.insert(meta);
                    }
                    Err(e) => warn!(kind = %self.kind, %group, %workspace, %name, error = %e, "undecodable record event"),
                }
            }
            ResourceEvent::Resource { group, workspace, name, action: Action::Delete, .. } => {
                let mut tree = self.tree.lock().await;
                let managed = tree.get(&group, &workspace, &name).map(|m| !m.memory_only).unwrap_or(false);
                if !managed {
                    return;
                }
                match self.store.get_resource(self.kind, &group, &workspace, &name).await {
                    Err(e) if e.is_not_found() => {
                        tree.remove(&group, &workspace, &name);
                    }
                    _ => debug!(kind = %self.kind, %group, %workspace, %name, "record present again; delete event skipped"),
                }
            }
            _ => {}
        }
    }

    /// Rebuild from the store after missed events. Cluster-only entries of
    /// workspaces that still exist are kept; workspaces that appeared in the
    /// meantime adopt their live objects.
    async fn resync(&self) {
        let mut tree = self.tree.lock().await;
        let stored = match self.store.get_resource_all_group(self.kind).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "resync read failed; tree left as is");
                return;
            }
        };
        let (mut fresh, skipped) = Tree::from_store(self.kind, stored);
        let old = std::mem::take(&mut *tree);
        let appeared: Vec<(String, String)> =
            fresh.workspace_keys().into_iter().filter(|(g, w)| !old.has_workspace(g, w)).collect();
        let carried = fresh.carry_memory_only(old);
        *tree = fresh;
        info!(kind = %self.kind, entries = tree.len(), carried, skipped, appeared = appeared.len(), "resource tree resynced");
        drop(tree);

        for (group, workspace) in appeared {
            match self.add_workspace(&group, &workspace).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => debug!(kind = %self.kind, %group, %workspace, "no cluster attached yet"),
                Err(e) => warn!(kind = %self.kind, %group, %workspace, error = %e, "listing workspace objects failed"),
            }
        }
    }
}

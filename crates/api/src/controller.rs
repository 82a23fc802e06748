//! Per-kind controller contracts exposed to the outer API layer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;
use ufleet_core::{Error, Kind, ObjectOptions, ResourceMeta, Result};
use ufleet_manager::ResourceManager;

/// Create/Update/Delete contract.
#[async_trait]
pub trait CurInterface: Send + Sync {
    fn kind(&self) -> Kind;

    async fn create(&self, group: &str, workspace: &str, raw: &str, opts: &ObjectOptions) -> Result<ResourceMeta>;

    async fn update(
        &self,
        group: &str,
        workspace: &str,
        name: &str,
        raw: &str,
        opts: &ObjectOptions,
    ) -> Result<ResourceMeta>;

    async fn delete(&self, group: &str, workspace: &str, name: &str, opts: &ObjectOptions) -> Result<()>;
}

/// Full-object contract: writes plus reads of the kind's tree.
#[async_trait]
pub trait ResourceController: CurInterface {
    async fn list_group(&self, group: &str) -> Result<Vec<ResourceMeta>>;

    async fn list_workspace(&self, group: &str, workspace: &str) -> Result<Vec<ResourceMeta>>;

    async fn get(&self, group: &str, workspace: &str, name: &str) -> Result<ResourceMeta>;

    /// Stored template, or the live object for cluster-only entries.
    async fn template(&self, group: &str, workspace: &str, name: &str) -> Result<String>;
}

#[async_trait]
impl CurInterface for ResourceManager {
    fn kind(&self) -> Kind {
        ResourceManager::kind(self)
    }

    async fn create(&self, group: &str, workspace: &str, raw: &str, opts: &ObjectOptions) -> Result<ResourceMeta> {
        self.create_object(group, workspace, raw, opts).await
    }

    async fn update(
        &self,
        group: &str,
        workspace: &str,
        name: &str,
        raw: &str,
        opts: &ObjectOptions,
    ) -> Result<ResourceMeta> {
        self.update_object(group, workspace, name, raw, opts).await
    }

    async fn delete(&self, group: &str, workspace: &str, name: &str, opts: &ObjectOptions) -> Result<()> {
        self.delete_object(group, workspace, name, opts).await
    }
}

#[async_trait]
impl ResourceController for ResourceManager {
    async fn list_group(&self, group: &str) -> Result<Vec<ResourceMeta>> {
        self.list_group_object(group).await
    }

    async fn list_workspace(&self, group: &str, workspace: &str) -> Result<Vec<ResourceMeta>> {
        self.list_group_workspace_object(group, workspace).await
    }

    async fn get(&self, group: &str, workspace: &str, name: &str) -> Result<ResourceMeta> {
        self.get_object(group, workspace, name).await
    }

    async fn template(&self, group: &str, workspace: &str, name: &str) -> Result<String> {
        self.get_object_template(group, workspace, name).await
    }
}

/// Which controller serves each kind. At most one of each contract per kind.
#[derive(Default)]
pub struct ControllerRegistry {
    cur: RwLock<HashMap<Kind, Arc<dyn CurInterface>>>,
    full: RwLock<HashMap<Kind, Arc<dyn ResourceController>>>,
}

fn insert_once<T: ?Sized>(
    map: &RwLock<HashMap<Kind, Arc<T>>>,
    kind: Kind,
    value: Arc<T>,
    what: &str,
) -> Result<()> {
    let mut map = map.write().map_err(|_| Error::internal("controller registry poisoned"))?;
    if map.contains_key(&kind) {
        return Err(Error::already_exists(format!("{} for {}", what, kind)));
    }
    map.insert(kind, value);
    info!(%kind, what, "controller registered");
    Ok(())
}

fn lookup<T: ?Sized>(map: &RwLock<HashMap<Kind, Arc<T>>>, kind: Kind, what: &str) -> Result<Arc<T>> {
    let map = map.read().map_err(|_| Error::internal("controller registry poisoned"))?;
    map.get(&kind).cloned().ok_or_else(|| Error::not_found(format!("{} for {}", what, kind)))
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cur_interface(&self, kind: Kind, controller: Arc<dyn CurInterface>) -> Result<()> {
        insert_once(&self.cur, kind, controller, "cur interface")
    }

    pub fn register_resource_controller(&self, kind: Kind, controller: Arc<dyn ResourceController>) -> Result<()> {
        insert_once(&self.full, kind, controller, "resource controller")
    }

    pub fn cur(&self, kind: Kind) -> Result<Arc<dyn CurInterface>> {
        lookup(&self.cur, kind, "cur interface")
    }

    pub fn controller(&self, kind: Kind) -> Result<Arc<dyn ResourceController>> {
        lookup(&self.full, kind, "resource controller")
    }

    /// Kinds with a full controller, sorted.
    pub fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self.full.read().map(|m| m.keys().copied().collect()).unwrap_or_default();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(Kind);

    #[async_trait]
    impl CurInterface for Noop {
        fn kind(&self) -> Kind {
            self.0
        }
        async fn create(&self, _: &str, _: &str, _: &str, _: &ObjectOptions) -> Result<ResourceMeta> {
            Err(Error::invalid("noop"))
        }
        async fn update(&self, _: &str, _: &str, _: &str, _: &str, _: &ObjectOptions) -> Result<ResourceMeta> {
            Err(Error::invalid("noop"))
        }
        async fn delete(&self, _: &str, _: &str, _: &str, _: &ObjectOptions) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn second_registration_is_rejected() {
        let reg = ControllerRegistry::new();
        reg.register_cur_interface(Kind::Pod, Arc::new(Noop(Kind::Pod))).unwrap();
        let err = reg.register_cur_interface(Kind::Pod, Arc::new(Noop(Kind::Pod))).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(reg.cur(Kind::Pod).unwrap().kind(), Kind::Pod);
        assert!(reg.cur(Kind::Service).err().unwrap().is_not_found());
        assert!(reg.controller(Kind::Pod).err().unwrap().is_not_found());
        assert!(reg.kinds().is_empty());
    }
}

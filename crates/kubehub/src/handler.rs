//! Per-kind view of one tenancy pair's namespace on its cluster.
//! Reads come from the watch cache; writes go to the cluster and record echo expectations.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tracing::debug;
use ufleet_core::{Action, Error, Kind, Result};

use crate::client::object_name;
use crate::registry::ClusterHandle;

pub struct KindHandler {
    handle: Arc<ClusterHandle>,
    kind: Kind,
    namespace: String,
}

impl KindHandler {
    pub(crate) fn new(handle: Arc<ClusterHandle>, kind: Kind, namespace: String) -> Self {
        Self { handle, kind, namespace }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cluster(&self) -> &str {
        self.handle.name()
    }

    /// Cached object, if any.
    pub fn get(&self, name: &str) -> Result<Option<Json>> {
        self.handle.cached(self.kind, &self.namespace, name)
    }

    /// Cached object decoded into a typed resource.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name)? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| Error::internal(format!("decoding {} {}: {}", self.kind, name, e))),
            None => Ok(None),
        }
    }

    pub fn list_cached(&self) -> Result<Vec<Json>> {
        self.handle.cached_list(self.kind, &self.namespace)
    }

    /// List straight from the cluster, bypassing the cache.
    pub async fn list_live(&self) -> Result<Vec<Json>> {
        let client = self.handle.client().clone();
        self.bounded(client.list(self.kind, &self.namespace)).await
    }

    /// Read straight from the cluster, bypassing the cache.
    pub async fn get_live(&self, name: &str) -> Result<Option<Json>> {
        let client = self.handle.client().clone();
        self.bounded(client.get(self.kind, &self.namespace, name)).await
    }

    pub async fn create(&self, object: &Json) -> Result<Json> {
        let name = self.target_name(object)?;
        let object = self.in_namespace(object);
        let client = self.handle.client().clone();
        self.write(Action::Create, &name, client.create(self.kind, &self.namespace, &object)).await
    }

    pub async fn update(&self, object: &Json) -> Result<Json> {
        let name = self.target_name(object)?;
        let object = self.in_namespace(object);
        let client = self.handle.client().clone();
        self.write(Action::Update, &name, client.update(self.kind, &self.namespace, &object)).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let client = self.handle.client().clone();
        self.write(Action::Delete, name, client.delete(self.kind, &self.namespace, name)).await
    }

    fn target_name(&self, object: &Json) -> Result<String> {
        object_name(object)
            .map(str::to_string)
            .ok_or_else(|| Error::invalid(format!("{} definition missing metadata.name", self.kind)))
    }

    fn in_namespace(&self, object: &Json) -> Json {
        let mut object = object.clone();
        if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(self.namespace.clone()));
        }
        object
    }

    async fn write<T>(&self, action: Action, name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let op = match action {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        let echo = self.handle.echo();
        echo.expect(self.kind, &self.namespace, name, action);
        let res = self.bounded(fut).await;
        counter!("cluster_writes_total", 1, "kind" => self.kind.as_str(), "op" => op);
        if let Err(e) = &res {
            echo.withdraw(self.kind, &self.namespace, name, action);
            counter!("cluster_write_errors_total", 1, "kind" => self.kind.as_str(), "op" => op);
            debug!(cluster = %self.handle.name(), kind = %self.kind, %name, op, error = %e, "cluster write failed");
        }
        res
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.handle.request_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::upstream(format!(
                "{} request to cluster {} timed out after {:?}",
                self.kind,
                self.handle.name(),
                timeout
            ))),
        }
    }
}

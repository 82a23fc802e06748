//! Seams to the managed cluster API and the tenancy config resolver.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use ufleet_core::{Error, Kind, Result, APP_LABEL};

/// Change delivered by a cluster watch, mirroring list+watch semantics.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Json),
    Deleted(Json),
    /// Full listing after (re)connect; the cache diffs it against its state.
    Restarted(Vec<Json>),
}

/// Connection descriptor for one physical cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Identity of the physical cluster; tenancy pairs with the same value share a handle.
    pub cluster: String,
    pub server: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ca_data: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Namespace backing the workspace.
    pub namespace: String,
}

impl ClusterDescriptor {
    /// True when a live connection built from `self` can serve `other`.
    pub fn same_connection(&self, other: &ClusterDescriptor) -> bool {
        self.server == other.server && self.token == other.token && self.ca_data == other.ca_data && self.insecure == other.insecure
    }
}

/// Per-kind object operations against one physical cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<Option<Json>>;
    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Json>>;
    async fn create(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json>;
    async fn update(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json>;
    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()>;
    /// All-namespace watch for a kind. Errors are transient; keep polling.
    fn watch(&self, kind: Kind) -> BoxStream<'static, Result<WatchEvent>>;
}

#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, desc: &ClusterDescriptor) -> Result<Arc<dyn ClusterClient>>;
}

/// Resolves a tenancy pair to the cluster that backs it.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, group: &str, workspace: &str, token: &str) -> Result<ClusterDescriptor>;
}

/// Parsed `metadata` of a raw object.
pub fn object_meta(obj: &Json) -> Result<ObjectMeta> {
    let meta = obj.get("metadata").cloned().ok_or_else(|| Error::invalid("object missing metadata"))?;
    serde_json::from_value(meta).map_err(|e| Error::invalid(format!("object metadata: {}", e)))
}

pub fn object_name(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str())
}

pub fn object_namespace(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str())
}

/// Application label, or the unowned sentinel.
pub fn object_app(obj: &Json) -> String {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(APP_LABEL))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Drop fields that only add noise to cached or rendered objects.
pub fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_accessors() {
        let obj = serde_json::json!({
            "metadata": {
                "name": "web",
                "namespace": "ns1",
                "labels": { "ufleet.io/app": "shop" },
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [ {"manager": "kubectl"} ]
            }
        });
        assert_eq!(object_name(&obj), Some("web"));
        assert_eq!(object_namespace(&obj), Some("ns1"));
        assert_eq!(object_app(&obj), "shop");
        let meta = object_meta(&obj).unwrap();
        assert!(meta.creation_timestamp.is_some());
        let mut stripped = obj.clone();
        strip_managed_fields(&mut stripped);
        assert!(stripped["metadata"].get("managedFields").is_none());
        assert_eq!(object_app(&serde_json::json!({"metadata": {}})), "");
    }
}

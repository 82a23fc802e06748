//! kube-rs backed cluster client and connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use serde_json::{json, Value as Json};
use tracing::{debug, info};
use ufleet_core::{Error, Kind, Result};

use crate::client::{ClusterClient, ClusterConnector, ClusterDescriptor, WatchEvent};

const FIELD_MANAGER: &str = "ufleet";

fn api_resource(kind: Kind) -> ApiResource {
    let c = kind.api();
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(c.group, c.version, kind.as_str()), c.plural)
}

fn kube_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(resp.message),
        kube::Error::Api(resp) if resp.code == 409 => Error::already_exists(resp.message),
        kube::Error::Api(resp) if resp.code == 422 || resp.code == 400 => Error::invalid(resp.message),
        other => Error::upstream(other),
    }
}

fn to_dynamic(object: &Json) -> Result<DynamicObject> {
    serde_json::from_value(object.clone()).map_err(|e| Error::invalid(format!("object definition: {}", e)))
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).map_err(|e| Error::internal(format!("serializing object: {}", e)))
}

/// Opens clients from connection descriptors.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    connect_timeout: Duration,
}

impl KubeConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for KubeConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn kubeconfig_for(desc: &ClusterDescriptor) -> Result<Kubeconfig> {
    let mut cluster = json!({ "server": desc.server, "insecure-skip-tls-verify": desc.insecure });
    if let Some(ca) = &desc.ca_data {
        cluster["certificate-authority-data"] = Json::String(ca.clone());
    }
    let mut user = json!({});
    if !desc.token.is_empty() {
        user["token"] = Json::String(desc.token.clone());
    }
    let raw = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": desc.cluster, "cluster": cluster }],
        "users": [{ "name": FIELD_MANAGER, "user": user }],
        "contexts": [{ "name": FIELD_MANAGER, "context": { "cluster": desc.cluster, "user": FIELD_MANAGER } }],
        "current-context": FIELD_MANAGER,
    });
    serde_json::from_value(raw).map_err(|e| Error::invalid(format!("kubeconfig for {}: {}", desc.cluster, e)))
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, desc: &ClusterDescriptor) -> Result<Arc<dyn ClusterClient>> {
        let kubeconfig = kubeconfig_for(desc)?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::upstream(format!("cluster {} config: {}", desc.cluster, e)))?;
        config.connect_timeout = Some(self.connect_timeout);
        // watches are long polls; writes carry their own deadline
        config.read_timeout = None;
        let client = Client::try_from(config).map_err(|e| Error::upstream(format!("cluster {} client: {}", desc.cluster, e)))?;
        info!(cluster = %desc.cluster, server = %desc.server, "kube client ready");
        Ok(Arc::new(KubeClusterClient { client }))
    }
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<Option<Json>> {
        let obj = self.namespaced(kind, namespace).get_opt(name).await.map_err(kube_err)?;
        obj.as_ref().map(to_json).transpose()
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Json>> {
        let list = self.namespaced(kind, namespace).list(&ListParams::default()).await.map_err(kube_err)?;
        list.items.iter().map(to_json).collect()
    }

    async fn create(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json> {
        let obj = to_dynamic(object)?;
        let created = self.namespaced(kind, namespace).create(&PostParams::default(), &obj).await.map_err(kube_err)?;
        to_json(&created)
    }

    async fn update(&self, kind: Kind, namespace: &str, object: &Json) -> Result<Json> {
        let name = object
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid("object missing metadata.name"))?;
        let api = self.namespaced(kind, namespace);
        // SSA on an absent object would create it
        if api.get_opt(name).await.map_err(kube_err)?.is_none() {
            return Err(Error::not_found(format!("{} {}/{}", kind, namespace, name)));
        }
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api.patch(name, &pp, &Patch::Apply(object)).await.map_err(kube_err)?;
        to_json(&obj)
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()> {
        self.namespaced(kind, namespace).delete(name, &DeleteParams::default()).await.map_err(kube_err)?;
        Ok(())
    }

    fn watch(&self, kind: Kind) -> BoxStream<'static, Result<WatchEvent>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &api_resource(kind));
        debug!(%kind, "opening cluster watch");
        watcher::watcher(api, watcher::Config::default())
            .map(|item| match item {
                Ok(Event::Applied(o)) => to_json(&o).map(WatchEvent::Applied),
                Ok(Event::Deleted(o)) => to_json(&o).map(WatchEvent::Deleted),
                Ok(Event::Restarted(list)) => list.iter().map(to_json).collect::<Result<Vec<_>>>().map(WatchEvent::Restarted),
                Err(e) => Err(Error::upstream(e)),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resources_use_kind_coordinates() {
        let ar = api_resource(Kind::Deployment);
        assert_eq!((ar.group.as_str(), ar.version.as_str(), ar.plural.as_str()), ("apps", "v1", "deployments"));
        assert_eq!(ar.api_version, "apps/v1");
        let ar = api_resource(Kind::ConfigMap);
        assert_eq!(ar.api_version, "v1");
    }

    #[test]
    fn kubeconfig_from_descriptor() {
        let desc = ClusterDescriptor {
            cluster: "c1".into(),
            server: "https://10.0.0.1:6443".into(),
            token: "t0k".into(),
            ca_data: None,
            insecure: true,
            namespace: "ns".into(),
        };
        let kc = kubeconfig_for(&desc).unwrap();
        assert_eq!(kc.current_context.as_deref(), Some("ufleet"));
        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(kc.clusters[0].name, "c1");
    }
}

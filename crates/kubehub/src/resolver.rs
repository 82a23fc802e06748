//! In-process config resolver backed by a mutable table.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;
use ufleet_core::{Error, Result, TenancyKey};

use crate::client::{ClusterDescriptor, ConfigResolver};

#[derive(Default)]
pub struct StaticResolver {
    table: RwLock<HashMap<TenancyKey, ClusterDescriptor>>,
    token: Option<String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only answer callers presenting `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self { table: RwLock::default(), token: Some(token.into()) }
    }

    pub fn set(&self, group: &str, workspace: &str, desc: ClusterDescriptor) {
        if let Ok(mut t) = self.table.write() {
            t.insert(TenancyKey::new(group, workspace), desc);
        }
    }

    pub fn remove(&self, group: &str, workspace: &str) -> Option<ClusterDescriptor> {
        self.table.write().ok()?.remove(&TenancyKey::new(group, workspace))
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConfigResolver for StaticResolver {
    async fn resolve(&self, group: &str, workspace: &str, token: &str) -> Result<ClusterDescriptor> {
        if let Some(expected) = &self.token {
            if expected != token {
                return Err(Error::invalid("resolver token rejected"));
            }
        }
        let key = TenancyKey::new(group, workspace);
        let table = self.table.read().map_err(|_| Error::internal("resolver table poisoned"))?;
        let desc = table.get(&key).cloned().ok_or_else(|| Error::not_found(format!("cluster config for {}", key)))?;
        debug!(tenancy = %key, cluster = %desc.cluster, "resolved cluster config");
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(cluster: &str) -> ClusterDescriptor {
        ClusterDescriptor {
            cluster: cluster.into(),
            server: format!("https://{}", cluster),
            token: String::new(),
            ca_data: None,
            insecure: false,
            namespace: "ns".into(),
        }
    }

    #[tokio::test]
    async fn resolves_known_pairs_and_checks_token() {
        let r = StaticResolver::with_token("s3cret");
        r.set("g1", "w1", desc("c1"));
        assert_eq!(r.resolve("g1", "w1", "s3cret").await.unwrap().cluster, "c1");
        assert!(matches!(r.resolve("g1", "w1", "nope").await, Err(Error::Invalid(_))));
        assert!(r.resolve("g1", "w2", "s3cret").await.unwrap_err().is_not_found());
        r.remove("g1", "w1");
        assert!(r.is_empty());
    }
}

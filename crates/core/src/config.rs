//! Runtime configuration read from `UFLEET_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kind::{parse_kind_list, Kind};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root prefix of the hierarchical store.
    pub store_root: String,
    /// Directory whose children name the known groups.
    pub group_registry: String,
    /// Directory whose children are `{group, name}` workspace records.
    pub workspace_registry: String,
    pub kinds: Vec<Kind>,
    pub watch_retry_ms: u64,
    pub request_timeout_secs: u64,
    pub cache_sync_timeout_secs: u64,
    pub event_queue_cap: usize,
    pub watch_buffer: usize,
    pub max_definition_bytes: usize,
    pub repair_secs: u64,
    pub resolver_token: String,
    pub db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: "/ufleet".into(),
            group_registry: "/registry/groups".into(),
            workspace_registry: "/registry/workspaces".into(),
            kinds: Kind::ALL.to_vec(),
            watch_retry_ms: 1000,
            request_timeout_secs: 30,
            cache_sync_timeout_secs: 60,
            event_queue_cap: 1024,
            watch_buffer: 4096,
            max_definition_bytes: 1_000_000,
            repair_secs: 300,
            resolver_token: String::new(),
            db_path: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl Config {
    /// Defaults overlaid with whatever `UFLEET_*` variables are set.
    pub fn from_env() -> Result<Self> {
        let mut c = Config::default();
        if let Ok(v) = std::env::var("UFLEET_STORE_ROOT") { c.store_root = v; }
        if let Ok(v) = std::env::var("UFLEET_GROUP_REGISTRY") { c.group_registry = v; }
        if let Ok(v) = std::env::var("UFLEET_WORKSPACE_REGISTRY") { c.workspace_registry = v; }
        if let Ok(v) = std::env::var("UFLEET_KINDS") { c.kinds = parse_kind_list(&v)?; }
        if let Some(v) = env_parse("UFLEET_WATCH_RETRY_MS") { c.watch_retry_ms = v; }
        if let Some(v) = env_parse("UFLEET_REQUEST_TIMEOUT_SECS") { c.request_timeout_secs = v; }
        if let Some(v) = env_parse("UFLEET_CACHE_SYNC_TIMEOUT_SECS") { c.cache_sync_timeout_secs = v; }
        if let Some(v) = env_parse("UFLEET_EVENT_QUEUE_CAP") { c.event_queue_cap = v; }
        if let Some(v) = env_parse("UFLEET_WATCH_BUFFER") { c.watch_buffer = v; }
        if let Some(v) = env_parse("UFLEET_MAX_DEFINITION_BYTES") { c.max_definition_bytes = v; }
        if let Some(v) = env_parse("UFLEET_REPAIR_SECS") { c.repair_secs = v; }
        if let Ok(v) = std::env::var("UFLEET_RESOLVER_TOKEN") { c.resolver_token = v; }
        c.db_path = std::env::var("UFLEET_DB_PATH").ok();
        Ok(c)
    }

    pub fn watch_retry(&self) -> Duration {
        Duration::from_millis(self.watch_retry_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs.max(1))
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_secs(self.repair_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overlays_defaults() {
        std::env::set_var("UFLEET_WATCH_RETRY_MS", "250");
        std::env::set_var("UFLEET_KINDS", "ConfigMap,Secret");
        std::env::set_var("UFLEET_REPAIR_SECS", "not a number");
        let c = Config::from_env().unwrap();
        assert_eq!(c.watch_retry(), Duration::from_millis(250));
        assert_eq!(c.kinds, vec![Kind::ConfigMap, Kind::Secret]);
        assert_eq!(c.repair_secs, Config::default().repair_secs);
        assert_eq!(c.store_root, "/ufleet");

        std::env::set_var("UFLEET_KINDS", "Widget");
        assert!(Config::from_env().is_err());
        for v in ["UFLEET_WATCH_RETRY_MS", "UFLEET_KINDS", "UFLEET_REPAIR_SECS"] {
            std::env::remove_var(v);
        }
    }
}

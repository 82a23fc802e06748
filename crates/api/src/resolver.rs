//! Config resolver reading cluster descriptors from a YAML file.
//!
//! ```yaml
//! token: s3cret            # optional; callers must present it
//! workspaces:
//!   team-a/dev:
//!     cluster: east-1
//!     server: https://east-1.example:6443
//!     token: eyJ...
//!     namespace: team-a-dev
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use ufleet_core::{Error, Result};
use ufleet_kubehub::{ClusterDescriptor, ConfigResolver};

#[derive(Debug, Default, Deserialize)]
struct ResolverFile {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    workspaces: BTreeMap<String, ClusterDescriptor>,
}

impl ResolverFile {
    fn parse(raw: &str) -> Result<Self> {
        let file: ResolverFile =
            serde_yaml::from_str(raw).map_err(|e| Error::invalid(format!("resolver file: {}", e)))?;
        for key in file.workspaces.keys() {
            match key.split_once('/') {
                Some((g, w)) if !g.is_empty() && !w.is_empty() && !w.contains('/') => {}
                _ => return Err(Error::invalid(format!("resolver file: key {:?} is not group/workspace", key))),
            }
        }
        Ok(file)
    }
}

pub struct FileResolver {
    path: Option<PathBuf>,
    file: RwLock<ResolverFile>,
}

impl FileResolver {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read(&path)?;
        info!(path = %path.display(), workspaces = file.workspaces.len(), "resolver file loaded");
        Ok(Self { path: Some(path), file: RwLock::new(file) })
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(Self { path: None, file: RwLock::new(ResolverFile::parse(raw)?) })
    }

    /// Re-read the backing file. On error the previous table stays in use.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else { return Ok(self.len()) };
        let file = read(path)?;
        let n = file.workspaces.len();
        *self.file.write().map_err(|_| Error::internal("resolver table poisoned"))? = file;
        info!(path = %path.display(), workspaces = n, "resolver file reloaded");
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.file.read().map(|f| f.workspaces.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read(path: &Path) -> Result<ResolverFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::upstream(format!("reading {}: {}", path.display(), e)))?;
    ResolverFile::parse(&raw)
}

#[async_trait]
impl ConfigResolver for FileResolver {
    async fn resolve(&self, group: &str, workspace: &str, token: &str) -> Result<ClusterDescriptor> {
        let file = self.file.read().map_err(|_| Error::internal("resolver table poisoned"))?;
        if let Some(expected) = &file.token {
            if expected != token {
                return Err(Error::invalid("resolver token rejected"));
            }
        }
        let key = format!("{}/{}", group, workspace);
        let desc = file.workspaces.get(&key).cloned().ok_or_else(|| Error::not_found(format!("cluster config for {}", key)))?;
        debug!(tenancy = %key, cluster = %desc.cluster, "resolved cluster config");
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
token: s3cret
workspaces:
  team-a/dev:
    cluster: east-1
    server: https://east-1.example:6443
    namespace: team-a-dev
  team-b/prod:
    cluster: west-1
    server: https://west-1.example:6443
    insecure: true
    namespace: team-b-prod
"#;

    #[tokio::test]
    async fn resolves_known_pairs() {
        let r = FileResolver::from_yaml(FILE).unwrap();
        assert_eq!(r.len(), 2);
        let d = r.resolve("team-a", "dev", "s3cret").await.unwrap();
        assert_eq!(d.cluster, "east-1");
        assert_eq!(d.namespace, "team-a-dev");
        assert!(!d.insecure);
        assert!(r.resolve("team-a", "qa", "s3cret").await.unwrap_err().is_not_found());
        assert!(r.resolve("team-a", "dev", "wrong").await.unwrap_err().is_client_error());
    }

    #[test]
    fn rejects_malformed_keys() {
        let raw = "workspaces:\n  nogroup:\n    cluster: c\n    server: s\n    namespace: n\n";
        assert!(FileResolver::from_yaml(raw).is_err());
    }

    #[tokio::test]
    async fn reload_picks_up_edits() {
        let path = std::env::temp_dir().join(format!("ufleet-resolver-{}.yaml", std::process::id()));
        std::fs::write(&path, "workspaces: {}\n").unwrap();
        let r = FileResolver::load(&path).unwrap();
        assert!(r.is_empty());
        std::fs::write(&path, FILE).unwrap();
        assert_eq!(r.reload().unwrap(), 2);
        assert!(r.resolve("team-b", "prod", "s3cret").await.is_ok());
        std::fs::remove_file(&path).unwrap();
    }
}

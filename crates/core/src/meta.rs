//! Tenancy keys and per-object metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Kind, Result};

/// Sentinel application name meaning "not attached to any application".
pub const UNOWNED_APP: &str = "";

static DNS1123: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

/// Reject names the cluster would refuse (DNS-1123 subdomain, max 253 chars).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 253 || !DNS1123.is_match(name) {
        return Err(Error::invalid(format!("invalid object name: {:?}", name)));
    }
    Ok(())
}

/// A `(group, workspace)` tenancy pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenancyKey {
    pub group: String,
    pub workspace: String,
}

impl TenancyKey {
    pub fn new(group: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self { group: group.into(), workspace: workspace.into() }
    }
}

impl fmt::Display for TenancyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.workspace)
    }
}

/// Metadata tracked for every managed or memory-only object.
///
/// `memory_only` is never persisted: records read back from the store are
/// managed by construction, and an object discovered in the cluster has an
/// empty `template`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub name: String,
    pub group: String,
    pub workspace: String,
    pub kind: Kind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub app: String,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub template: String,
    #[serde(skip)]
    pub memory_only: bool,
}

impl ResourceMeta {
    /// Metadata for an object created through this system.
    pub fn managed(key: &TenancyKey, kind: Kind, name: &str, opts: &ObjectOptions, template: String) -> Self {
        Self {
            name: name.to_string(),
            group: key.group.clone(),
            workspace: key.workspace.clone(),
            kind,
            user: opts.user.clone(),
            comment: opts.comment.clone(),
            app: opts.app.clone(),
            create_time: Utc::now(),
            template,
            memory_only: false,
        }
    }

    /// Metadata for an object discovered in the cluster.
    pub fn memory_only(key: &TenancyKey, kind: Kind, name: &str, app: &str, create_time: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.to_string(),
            group: key.group.clone(),
            workspace: key.workspace.clone(),
            kind,
            user: String::new(),
            comment: String::new(),
            app: app.to_string(),
            create_time: create_time.unwrap_or_else(Utc::now),
            template: String::new(),
            memory_only: true,
        }
    }

    pub fn tenancy(&self) -> TenancyKey {
        TenancyKey::new(self.group.clone(), self.workspace.clone())
    }

    pub fn has_app(&self) -> bool {
        self.app != UNOWNED_APP
    }

    /// Serialize as the persisted store record.
    pub fn to_record(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::internal(format!("encoding record {}: {}", self.name, e)))
    }

    /// Decode a persisted store record. A record without a template is corrupt.
    pub fn from_record(raw: &str) -> Result<Self> {
        let meta: ResourceMeta =
            serde_json::from_str(raw).map_err(|e| Error::internal(format!("decoding record: {}", e)))?;
        if meta.template.is_empty() {
            return Err(Error::internal(format!("record {} has no template", meta.name)));
        }
        Ok(meta)
    }
}

/// Caller-supplied options for create/update/delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectOptions {
    /// Creator recorded on the object.
    pub user: String,
    pub comment: String,
    /// Application the object belongs to; empty means unowned.
    pub app: String,
    /// Do not notify the application tracker on delete.
    pub suppress_app_event: bool,
}

impl ObjectOptions {
    pub fn by(user: impl Into<String>) -> Self {
        Self { user: user.into(), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("cfg1").is_ok());
        assert!(validate_name("web.frontend-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("-lead").is_err());
    }

    #[test]
    fn record_skips_memory_only_flag() {
        let key = TenancyKey::new("g1", "w1");
        let meta = ResourceMeta::managed(&key, Kind::ConfigMap, "cfg1", &ObjectOptions::by("alice"), "{}".into());
        let raw = meta.to_record().unwrap();
        assert!(!raw.contains("memory_only"));
        let back = ResourceMeta::from_record(&raw).unwrap();
        assert_eq!(back, meta);
        assert!(!back.memory_only);
    }

    #[test]
    fn record_without_template_is_rejected() {
        let key = TenancyKey::new("g1", "w1");
        let meta = ResourceMeta::memory_only(&key, Kind::Pod, "p", "", None);
        let raw = meta.to_record().unwrap();
        assert!(matches!(ResourceMeta::from_record(&raw), Err(Error::Internal(_))));
    }
}

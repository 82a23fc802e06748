//! Built-in resource kinds and their API coordinates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A resource type managed by exactly one Resource Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    ConfigMap,
    Secret,
    Service,
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Job,
    CronJob,
    Ingress,
    PersistentVolumeClaim,
    HorizontalPodAutoscaler,
}

/// API group, version and plural resource name for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCoords {
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
}

impl ApiCoords {
    /// `apiVersion` as written in object definitions (`v1`, `apps/v1`, ...).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Kind {
    pub const ALL: [Kind; 13] = [
        Kind::ConfigMap,
        Kind::Secret,
        Kind::Service,
        Kind::Pod,
        Kind::Deployment,
        Kind::StatefulSet,
        Kind::DaemonSet,
        Kind::ReplicaSet,
        Kind::Job,
        Kind::CronJob,
        Kind::Ingress,
        Kind::PersistentVolumeClaim,
        Kind::HorizontalPodAutoscaler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::ConfigMap => "ConfigMap",
            Kind::Secret => "Secret",
            Kind::Service => "Service",
            Kind::Pod => "Pod",
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::ReplicaSet => "ReplicaSet",
            Kind::Job => "Job",
            Kind::CronJob => "CronJob",
            Kind::Ingress => "Ingress",
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
            Kind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
        }
    }

    pub fn api(&self) -> ApiCoords {
        let (group, version, plural) = match self {
            Kind::ConfigMap => ("", "v1", "configmaps"),
            Kind::Secret => ("", "v1", "secrets"),
            Kind::Service => ("", "v1", "services"),
            Kind::Pod => ("", "v1", "pods"),
            Kind::PersistentVolumeClaim => ("", "v1", "persistentvolumeclaims"),
            Kind::Deployment => ("apps", "v1", "deployments"),
            Kind::StatefulSet => ("apps", "v1", "statefulsets"),
            Kind::DaemonSet => ("apps", "v1", "daemonsets"),
            Kind::ReplicaSet => ("apps", "v1", "replicasets"),
            Kind::Job => ("batch", "v1", "jobs"),
            Kind::CronJob => ("batch", "v1", "cronjobs"),
            Kind::Ingress => ("networking.k8s.io", "v1", "ingresses"),
            Kind::HorizontalPodAutoscaler => ("autoscaling", "v2", "horizontalpodautoscalers"),
        };
        ApiCoords { group, version, plural }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.api().plural == s)
            .ok_or_else(|| Error::invalid(format!("invalid kind: {}", s)))
    }
}

/// Parse a comma separated kind list (`ConfigMap,deployments,...`).
pub fn parse_kind_list(s: &str) -> Result<Vec<Kind>, Error> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let k: Kind = part.parse()?;
        if !out.contains(&k) {
            out.push(k);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_plurals() {
        assert_eq!("ConfigMap".parse::<Kind>().unwrap(), Kind::ConfigMap);
        assert_eq!("deployment".parse::<Kind>().unwrap(), Kind::Deployment);
        assert_eq!("ingresses".parse::<Kind>().unwrap(), Kind::Ingress);
        let e = "Widget".parse::<Kind>().unwrap_err();
        assert!(e.to_string().contains("invalid kind"), "e={}", e);
    }

    #[test]
    fn api_versions() {
        assert_eq!(Kind::Pod.api().api_version(), "v1");
        assert_eq!(Kind::Deployment.api().api_version(), "apps/v1");
        assert_eq!(Kind::HorizontalPodAutoscaler.api().api_version(), "autoscaling/v2");
    }

    #[test]
    fn kind_list_dedups() {
        let v = parse_kind_list("ConfigMap, pods,configmaps,,Job").unwrap();
        assert_eq!(v, vec![Kind::ConfigMap, Kind::Pod, Kind::Job]);
    }
}

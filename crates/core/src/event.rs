//! Events flowing from the store watcher, the cluster watch caches and to the
//! application tracker.

use serde::{Deserialize, Serialize};

use crate::{Kind, TenancyKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// A decoded change below the store root for one kind.
///
/// The granularity is fixed when the event is built at the watch boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Group {
        group: String,
        action: Action,
    },
    Workspace {
        group: String,
        workspace: String,
        action: Action,
    },
    Resource {
        group: String,
        workspace: String,
        name: String,
        /// Record value; absent for deletes.
        value: Option<String>,
        action: Action,
    },
}

impl ResourceEvent {
    pub fn action(&self) -> Action {
        match self {
            ResourceEvent::Group { action, .. }
            | ResourceEvent::Workspace { action, .. }
            | ResourceEvent::Resource { action, .. } => *action,
        }
    }

    pub fn group(&self) -> &str {
        match self {
            ResourceEvent::Group { group, .. }
            | ResourceEvent::Workspace { group, .. }
            | ResourceEvent::Resource { group, .. } => group,
        }
    }
}

/// A change observed by a cluster watch cache for one tenancy pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEvent {
    pub kind: Kind,
    pub tenancy: TenancyKey,
    pub name: String,
    pub action: Action,
    /// Echo of a write issued by this system; never acted upon.
    pub from_ufleet: bool,
    /// Live object as seen by the cache (last known state for deletes).
    pub object: serde_json::Value,
}

/// Notification for the application tracker when an owned object goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEvent {
    pub group: String,
    pub workspace: String,
    pub resource: String,
    pub kind: Kind,
    pub action: Action,
    pub app: String,
}

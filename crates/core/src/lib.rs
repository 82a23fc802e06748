//! ufleet core types: kinds, tenancy keys, resource metadata, events and errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod kind;
pub mod meta;

pub use error::{Error, Result};
pub use event::{Action, AppEvent, ClusterEvent, ResourceEvent};
pub use kind::Kind;
pub use meta::{ObjectOptions, ResourceMeta, TenancyKey, UNOWNED_APP};

/// Annotation stamped on every object this system writes to a cluster.
pub const PROVENANCE_ANNOTATION: &str = "ufleet.io/created-by";
/// Value of [`PROVENANCE_ANNOTATION`].
pub const PROVENANCE_VALUE: &str = "ufleet";
/// Label carrying the logical application an object belongs to.
pub const APP_LABEL: &str = "ufleet.io/app";

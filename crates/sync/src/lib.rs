//! ufleet sync: aligns the store's tenancy structure with the external
//! group and workspace registries.

#![forbid(unsafe_code)]

pub mod reconciler;
pub mod registry;

pub use reconciler::Reconciler;
pub use registry::{ExternalRegistry, WorkspaceRecord};

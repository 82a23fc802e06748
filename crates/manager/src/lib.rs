//! ufleet manager: one [`ResourceManager`] per kind, merging stored records
//! and live cluster objects into a single tree.

#![forbid(unsafe_code)]

pub mod definition;
pub mod manager;
pub mod notify;
pub mod repair;
pub mod tree;

pub use definition::{parse_definition, Definition, DefinitionLimits};
pub use manager::ResourceManager;
pub use notify::AppNotifier;
pub use repair::{Divergence, Inconsistency, RepairReport};
pub use tree::Tree;

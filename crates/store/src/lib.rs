//! ufleet store: watchable kv tree, the hierarchical resource store on top of
//! it, and the watcher that turns store changes into per-kind events.

#![forbid(unsafe_code)]

pub mod hierarchy;
pub mod kv;
pub mod watcher;

pub use hierarchy::{HierarchicalStore, KindTree};
pub use kv::{ChangeFeed, KvBackend, KvChange, KvNode, KvWatcher, MemoryKv, WatchError};
pub use watcher::{EventHandlerRegistry, StoreEventHandler, StoreWatcher};

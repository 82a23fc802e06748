//! ufleet kubehub: connections to managed clusters, their watch caches and
//! the per-kind handlers the resource managers write through.

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod fake;
pub mod handler;
pub mod registry;
pub mod remote;
pub mod resolver;

pub use cache::{Bindings, EchoLedger, EventSinks, WatchCache};
pub use client::{ClusterClient, ClusterConnector, ClusterDescriptor, ConfigResolver, WatchEvent};
pub use handler::KindHandler;
pub use registry::{ClusterHandle, ClusterRegistry, RegistrySettings};
pub use remote::{KubeClusterClient, KubeConnector};
pub use resolver::StaticResolver;

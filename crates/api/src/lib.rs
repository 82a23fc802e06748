//! ufleet API surface (in-process).
//!
//! What the outer API layer depends on: the per-kind controller contracts,
//! their registry, the error shape it reports, and the [`ControlPlane`]
//! that wires every component together at startup.

#![forbid(unsafe_code)]

pub mod controller;
pub mod error;
pub mod plane;
pub mod resolver;

pub use controller::{ControllerRegistry, CurInterface, ResourceController};
pub use error::{ApiError, ApiResult};
pub use plane::{assemble, ControlPlane};
pub use resolver::FileResolver;

//! Data models for the Mesh Hub
//!
//! Registry, catalog and service rows plus the wire payloads exchanged on the bus.

mod catalog;
mod error;
mod heartbeat;
mod registry;
mod service;

pub use catalog::*;
pub use error::*;
pub use heartbeat::*;
pub use registry::*;
pub use service::*;

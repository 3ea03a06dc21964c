//! API module for the Mesh Hub
//!
//! HTTP health probes, read-only REST views and the JSON-RPC gateway.

mod health;
mod responses;
mod rest;
mod rpc;

pub use health::*;
pub use responses::*;
pub use rest::*;
pub use rpc::*;

//! Message bus plumbing: subject matching, routing, transports and the event bridge

mod bridge;
mod nats;
mod router;
pub mod subject;
mod transport;

pub use bridge::*;
pub use nats::*;
pub use router::*;
pub use subject::{matches, qualify};
pub use transport::*;

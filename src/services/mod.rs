//! Long-running federation services

mod heartbeat_consumer;
mod presence_service;

pub use heartbeat_consumer::*;
pub use presence_service::*;

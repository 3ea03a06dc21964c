//! Runtime helpers shared by the long-running services

mod tasks;

pub use tasks::*;

//! Configuration module for the Mesh Hub
//!
//! Supports loading configuration from TOML files and environment variables.

mod settings;

pub use settings::*;

//! Storage layer for the Mesh Hub
//!
//! Uses RocksDB for persistent storage of registry, catalog and health rows.

mod records;
mod rocks;

pub use records::*;
pub use rocks::*;

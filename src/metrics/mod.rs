//! Process metrics exported in Prometheus text format

mod prometheus;

pub use self::prometheus::*;

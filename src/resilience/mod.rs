//! Failure isolation for outbound probes

mod circuit_breaker;
mod rate_limiter;

pub use circuit_breaker::*;
pub use rate_limiter::*;

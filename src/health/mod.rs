//! Service health monitoring

mod checker;
mod probe;

pub use checker::*;
pub use probe::*;

//! Microgrid dispatch controller library surface.
//!
//! The binary (`src/main.rs`) wires these modules together; they're
//! exposed here mainly so integration tests in `tests/` can drive the
//! pipeline end-to-end without going through the process entrypoint.

pub mod broadcaster;
pub mod confidence;
pub mod config;
pub mod endpoint;
pub mod forecaster;
pub mod metrics;
pub mod node;
pub mod observer;
pub mod oracle;
pub mod snapshot;
pub mod solver;
pub mod tick;
pub mod wire;

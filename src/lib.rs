//! Coordination engine for teams of parallel AI-agent workers.
//!
//! Workers publish heartbeats, negotiate interface contracts with each
//! other and receive tasks from a phase-gated scheduler. A manager scans the
//! combined state and emits corrective actions that the coordinator applies.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, Result};

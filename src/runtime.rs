//! Runtime glue that wires configs, progress planning, error reporting,
//! telemetry, and runner orchestration.

pub mod config;
pub mod error;
pub mod progress;
pub mod runner;
pub mod telemetry;

//! Runtime glue that wires configs, progress tracking, telemetry, fatal error
//! handling, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod progress;
pub mod runner;
pub mod telemetry;

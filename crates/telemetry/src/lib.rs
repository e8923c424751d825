//! # Budgetgrid Telemetry
//!
//! Structured logging for the writeback core. Every crate logs through
//! `tracing`; this crate installs the subscriber once per process.

pub mod logging;

pub use logging::{init, LogLevel};

//! # framelog-engine
//!
//! Asynchronous writer engine for framelog streams.
//!
//! This crate provides:
//! - A bounded queue with suspend or fail-fast backpressure
//! - A single writer task that appends, syncs and rotates files
//! - Cancellation of records whose producer went away
//! - Orderly shutdown that drains admitted records
//! - Layered configuration (defaults, YAML file, environment)

pub mod config;
pub mod engine;
pub mod error;
mod writer;

pub use config::{Backpressure, Config, ConfigError, EngineConfig, FsyncPolicy};
pub use engine::{AppendResult, EngineState, EngineStats, PendingAppend, WriterEngine};
pub use error::EngineError;

//! Shared tracing/logging setup for the offline client process.

pub mod tracing;

pub use tracing::{init, init_json};

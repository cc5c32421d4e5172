//! TensorBridge common library
//!
//! This crate contains shared code used by the host and the worker process.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{BridgeConfig, ExecutionMode};
pub use error::{cause_chain, BridgeError, ExecutionError, ExecutionErrorKind, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};

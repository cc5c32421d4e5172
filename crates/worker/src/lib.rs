//! TensorBridge Worker
//!
//! Everything that touches a loaded model: tensors, the shared-memory tensor
//! channel, native engines, and the task loop that serves a host over
//! stdin/stdout. The host-side runner links this crate for the in-process
//! path and the channel; the worker binary links it for the service.

pub mod engine;
pub mod package;
pub mod service;
pub mod session;
pub mod shm;
pub mod signature;
pub mod tensor;

pub use engine::{loader_for, Feed, ModelLoader, NativeModel};
pub use service::{serve_stdio, WorkerService};
pub use session::ModelSession;
pub use shm::{ReleaseReport, SegmentScope, ShmChannel};
pub use signature::{Signature, SignatureEntry};
pub use tensor::{DType, Element, Tensor, TensorData};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging to stderr. `RUST_LOG` wins over `default_level`.
///
/// Stdout is reserved for protocol traffic in worker processes.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "tensorbridge_worker={level},tensorbridge_runner={level},tensorbridge={level}",
            level = default_level
        )
        .into()
    });

    // A subscriber may already be set when embedded; keep the existing one
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

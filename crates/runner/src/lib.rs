//! TensorBridge Runner
//!
//! Host side of out-of-process inference: supervises worker processes,
//! tracks tasks through their lifecycle, and exposes the execution facade
//! that hides whether a model runs in-process or in a worker.

pub mod facade;
pub mod launch;
pub mod process;
pub mod task;

pub use facade::{ExecutionFacade, FacadeState};
pub use launch::{default_worker_program, resolve_command_line};
pub use process::{HandleState, WorkerOptions, WorkerProcess};
pub use task::{Canceller, Task};

//! Common error types for TensorBridge
//!
//! This module defines all error types used across the host and the worker
//! process. Failures that cross the worker-process boundary are wrapped once
//! into [`ExecutionError`], which carries the serialized cause chain reported
//! by the worker.

use std::fmt;
use thiserror::Error;

/// Main error type for TensorBridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model loading errors (missing files, unreadable archive, rejected format)
    #[error("Failed to load model: {cause}")]
    LoadModel {
        cause: String,
        #[source]
        source: Option<Box<BridgeError>>,
    },

    /// The model produced a different number of outputs than requested
    #[error("Output count mismatch: expected {expected} output tensors, model produced {actual}")]
    OutputCountMismatch { expected: usize, actual: usize },

    /// Caller-supplied tensors are unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Descriptor and segment contents disagree, or a malformed message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Named shared memory segment does not exist or was already released
    #[error("Shared memory segment not found: {0}")]
    SegmentNotFound(String),

    /// Memory mapping errors
    #[error("Shared memory error: {0}")]
    Segment(String),

    /// Tensor name could not be resolved against the model signature
    #[error("Name resolution error: {0}")]
    NameResolution(String),

    /// Native engine errors during execution
    #[error("Engine error: {0}")]
    Engine(String),

    /// Failure reported across the worker-process boundary
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Worker handle is no longer usable
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Model archive errors
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a task failed on the far side of the process boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The worker reported a handled error
    Failed,

    /// The task was cancelled before completion
    Canceled,

    /// The worker process terminated while the task was outstanding
    Crashed,
}

impl ExecutionErrorKind {
    /// Tag used in error messages
    pub fn tag(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Failed => "failed",
            ExecutionErrorKind::Canceled => "canceled",
            ExecutionErrorKind::Crashed => "unrecoverable",
        }
    }
}

/// Single wrapper for errors raised at the worker-process boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,

    /// Serialized cause chain, outermost first
    pub causes: Vec<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, causes: Vec<String>) -> Self {
        Self { kind, causes }
    }

    /// Primary message, if the worker reported one
    pub fn message(&self) -> Option<&str> {
        self.causes.first().map(String::as_str)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution error ({})", self.kind.tag())?;
        let mut causes = self.causes.iter();
        if let Some(first) = causes.next() {
            write!(f, ": {}", first)?;
        }
        for cause in causes {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}

impl BridgeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }

    /// Create a model loading error
    pub fn load_model(cause: impl Into<String>) -> Self {
        BridgeError::LoadModel {
            cause: cause.into(),
            source: None,
        }
    }

    /// Wrap another error as a model loading error, keeping it as the source
    pub fn load_model_from(err: BridgeError) -> Self {
        match err {
            BridgeError::LoadModel { .. } => err,
            other => BridgeError::LoadModel {
                cause: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BridgeError::InvalidInput(msg.into())
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::ProtocolViolation(msg.into())
    }

    /// Create a shared memory error
    pub fn segment(msg: impl Into<String>) -> Self {
        BridgeError::Segment(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        BridgeError::Engine(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        BridgeError::WorkerUnavailable(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        BridgeError::InvalidState(msg.into())
    }

    /// Whether the owning worker handle must be recreated before retrying
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::Execution(ExecutionError {
                kind: ExecutionErrorKind::Crashed,
                ..
            })
        )
    }

    /// Execution error kind, if this error crossed the process boundary
    pub fn execution_kind(&self) -> Option<ExecutionErrorKind> {
        match self {
            BridgeError::Execution(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Serialize an error and its `source()` chain, outermost first
pub fn cause_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

/// Result type alias for TensorBridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

//! TensorBridge wire protocol
//!
//! Messages exchanged between the host and a worker process as JSON Lines:
//! one JSON object per line, host → worker on the worker's stdin and
//! worker → host on its stdout.
//!
//! ```text
//! {"type":"execute","id":2,"request":{"command":"INFERENCE","args":{"inputs":[..],"outputs":[..]}}}
//! {"type":"launch","id":2}
//! {"type":"completion","id":2,"outputs":[..]}
//! ```
//!
//! Each command carries its own argument struct, so arguments are validated
//! when a line is parsed instead of being looked up by key later.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Task identifier, monotonic per worker handle starting at 1
pub type TaskId = u64;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    /// The worker reported a handled error
    Failed,
    /// Cancelled before completion
    Canceled,
    /// The worker process terminated while the task was outstanding.
    /// Never sent by a worker; inferred by the host.
    Crashed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Crashed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes a tensor without carrying its bulk data.
///
/// `shape` and `dtype` are omitted for an empty output placeholder; the
/// segment named by `memory_name` still belongs to the tensor so the worker
/// has a slot to write into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    pub is_input: bool,

    pub memory_name: String,
}

impl TensorDescriptor {
    /// Descriptor for an input tensor
    pub fn input(name: impl Into<String>, shape: Vec<usize>, dtype: impl Into<String>, memory_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Some(shape),
            dtype: Some(dtype.into()),
            is_input: true,
            memory_name: memory_name.into(),
        }
    }

    /// Descriptor for an output whose shape is already known
    pub fn output(name: impl Into<String>, shape: Vec<usize>, dtype: impl Into<String>, memory_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Some(shape),
            dtype: Some(dtype.into()),
            is_input: false,
            memory_name: memory_name.into(),
        }
    }

    /// Descriptor for an output the worker will size
    pub fn placeholder(name: impl Into<String>, memory_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: None,
            dtype: None,
            is_input: false,
            memory_name: memory_name.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.shape.is_none() && self.dtype.is_none()
    }

    /// Check the descriptor invariants
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_name.is_empty() {
            return Err(format!("tensor '{}' has no memory segment name", self.name));
        }
        if self.shape.is_some() != self.dtype.is_some() {
            return Err(format!(
                "tensor '{}' must carry both shape and dtype or neither",
                self.name
            ));
        }
        if self.is_input && self.is_placeholder() {
            return Err(format!("input tensor '{}' is missing shape and dtype", self.name));
        }
        Ok(())
    }
}

/// Arguments of LOAD_MODEL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelArgs {
    pub model_folder: PathBuf,
}

/// Arguments of INFERENCE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceArgs {
    pub inputs: Vec<TensorDescriptor>,
    pub outputs: Vec<TensorDescriptor>,
}

impl InferenceArgs {
    /// Check roles, descriptor invariants and segment name uniqueness
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for descriptor in &self.inputs {
            if !descriptor.is_input {
                return Err(format!("'{}' is listed as an input but flagged as output", descriptor.name));
            }
            descriptor.validate()?;
            if !names.insert(descriptor.memory_name.as_str()) {
                return Err(format!("segment '{}' is referenced twice", descriptor.memory_name));
            }
        }
        for descriptor in &self.outputs {
            if descriptor.is_input {
                return Err(format!("'{}' is listed as an output but flagged as input", descriptor.name));
            }
            descriptor.validate()?;
            if !names.insert(descriptor.memory_name.as_str()) {
                return Err(format!("segment '{}' is referenced twice", descriptor.memory_name));
            }
        }
        Ok(())
    }
}

/// Arguments of CLOSE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseArgs {}

/// A unit of work for the worker: command name plus typed arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRequest {
    LoadModel(LoadModelArgs),
    Inference(InferenceArgs),
    Close(CloseArgs),
}

impl TaskRequest {
    pub fn command_name(&self) -> &'static str {
        match self {
            TaskRequest::LoadModel(_) => "LOAD_MODEL",
            TaskRequest::Inference(_) => "INFERENCE",
            TaskRequest::Close(_) => "CLOSE",
        }
    }

    pub fn close() -> Self {
        TaskRequest::Close(CloseArgs {})
    }
}

/// Host → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run a task
    Execute { id: TaskId, request: TaskRequest },

    /// Ask the worker to stop the task at its next checkpoint
    Cancel { id: TaskId },
}

/// Worker → host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The task started running
    Launch { id: TaskId },

    /// The task finished; `outputs` describes what was written, in request order
    Completion {
        id: TaskId,
        #[serde(default)]
        outputs: Vec<TensorDescriptor>,
    },

    /// The task raised a handled error
    Failure {
        id: TaskId,
        error: String,
        #[serde(default)]
        causes: Vec<String>,
    },

    /// The task honoured a cancel request
    Cancellation { id: TaskId },
}

impl WorkerMessage {
    pub fn id(&self) -> TaskId {
        match self {
            WorkerMessage::Launch { id }
            | WorkerMessage::Completion { id, .. }
            | WorkerMessage::Failure { id, .. }
            | WorkerMessage::Cancellation { id } => *id,
        }
    }

    /// Status this message moves its task to
    pub fn status(&self) -> TaskStatus {
        match self {
            WorkerMessage::Launch { .. } => TaskStatus::Running,
            WorkerMessage::Completion { .. } => TaskStatus::Completed,
            WorkerMessage::Failure { .. } => TaskStatus::Failed,
            WorkerMessage::Cancellation { .. } => TaskStatus::Canceled,
        }
    }
}

/// Serialize a message as a single line (without the trailing newline)
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Parse one line of the protocol
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inference_request_wire_shape() {
        let message = HostMessage::Execute {
            id: 2,
            request: TaskRequest::Inference(InferenceArgs {
                inputs: vec![TensorDescriptor::input("x", vec![1, 3], "float32", "tb-in")],
                outputs: vec![TensorDescriptor::placeholder("y", "tb-out")],
            }),
        };

        let value: serde_json::Value = serde_json::from_str(&encode_line(&message).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "execute",
                "id": 2,
                "request": {
                    "command": "INFERENCE",
                    "args": {
                        "inputs": [{"name": "x", "shape": [1, 3], "dtype": "float32", "isInput": true, "memoryName": "tb-in"}],
                        "outputs": [{"name": "y", "isInput": false, "memoryName": "tb-out"}]
                    }
                }
            })
        );
    }

    #[test]
    fn test_load_and_close_parse() {
        let load: HostMessage = decode_line(
            r#"{"type":"execute","id":1,"request":{"command":"LOAD_MODEL","args":{"modelFolder":"/models/unet"}}}"#,
        )
        .unwrap();
        assert_eq!(
            load,
            HostMessage::Execute {
                id: 1,
                request: TaskRequest::LoadModel(LoadModelArgs {
                    model_folder: PathBuf::from("/models/unet"),
                }),
            }
        );

        let close: HostMessage =
            decode_line(r#"{"type":"execute","id":3,"request":{"command":"CLOSE","args":{}}}"#).unwrap();
        assert_eq!(close, HostMessage::Execute { id: 3, request: TaskRequest::close() });

        let unknown = decode_line::<HostMessage>(
            r#"{"type":"execute","id":4,"request":{"command":"TRAIN","args":{}}}"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_worker_message_status() {
        let failure: WorkerMessage =
            decode_line(r#"{"type":"failure","id":7,"error":"boom","causes":["boom","root"]}"#).unwrap();
        assert_eq!(failure.id(), 7);
        assert_eq!(failure.status(), TaskStatus::Failed);

        let completion: WorkerMessage = decode_line(r#"{"type":"completion","id":8}"#).unwrap();
        assert_eq!(completion.status(), TaskStatus::Completed);
        assert_eq!(completion, WorkerMessage::Completion { id: 8, outputs: vec![] });

        assert!(TaskStatus::Crashed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_inference_args_validation() {
        let mut args = InferenceArgs {
            inputs: vec![TensorDescriptor::input("x", vec![2], "int32", "tb-a")],
            outputs: vec![TensorDescriptor::placeholder("y", "tb-a")],
        };
        assert!(args.validate().unwrap_err().contains("referenced twice"));

        args.outputs[0].memory_name = "tb-b".to_string();
        assert!(args.validate().is_ok());

        args.outputs[0].shape = Some(vec![2]);
        assert!(args.validate().unwrap_err().contains("both shape and dtype"));

        let mut input = TensorDescriptor::placeholder("x", "tb-c");
        input.is_input = true;
        assert!(input.validate().is_err());
    }
}

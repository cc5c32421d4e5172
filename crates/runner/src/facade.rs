//! Execution facade
//!
//! One entry point for loading and running a model, either inside this
//! process or inside a supervised worker process. Callers see the same
//! load/run/close operations and the same lifecycle in both modes:
//!
//! ```text
//! Unloaded → Loading → Loaded ⇄ Running
//!     ↑          │        │
//!     └─ failure ┘        └→ Closed
//! ```
//!
//! A worker crash moves the facade to `Defunct`; every later load or run
//! fails fast until the facade is closed and a new one is built.

use crate::launch::resolve_command_line;
use crate::process::{WorkerOptions, WorkerProcess};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tensorbridge_common::{BridgeConfig, BridgeError, LatencyTimer, Result, METRICS};
use tensorbridge_proto::{InferenceArgs, LoadModelArgs, TaskRequest};
use tensorbridge_worker::{loader_for, ModelLoader, ModelSession, SegmentScope, ShmChannel, Signature, Tensor};
use tracing::{debug, info, warn};

/// Lifecycle state of a facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Unloaded,
    Loading,
    Loaded,
    Running,
    Closed,
    /// The worker process died; only close is allowed
    Defunct,
}

impl fmt::Display for FacadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FacadeState::Unloaded => "unloaded",
            FacadeState::Loading => "loading",
            FacadeState::Loaded => "loaded",
            FacadeState::Running => "running",
            FacadeState::Closed => "closed",
            FacadeState::Defunct => "defunct",
        };
        f.write_str(name)
    }
}

enum Backend {
    InProcess {
        loader: Arc<dyn ModelLoader>,
        archive_names: Vec<String>,
        session: Option<ModelSession>,
    },
    OutOfProcess {
        worker: WorkerProcess,
        channel: ShmChannel,
    },
}

/// Loads and runs one model at a time
pub struct ExecutionFacade {
    state: FacadeState,
    backend: Backend,
    model_dir: Option<PathBuf>,
}

impl fmt::Debug for ExecutionFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionFacade")
            .field("state", &self.state)
            .field("out_of_process", &self.is_out_of_process())
            .field("model_dir", &self.model_dir)
            .finish()
    }
}

impl ExecutionFacade {
    /// Build a facade for the configured execution mode and engine
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        if config.execution.mode.uses_worker_process() {
            let command_line = resolve_command_line(config)?;
            Self::out_of_process(&command_line, config)
        } else {
            Ok(Self::in_process(loader_for(&config.model.engine)?, config))
        }
    }

    /// Facade that runs models inside this process
    pub fn in_process(loader: Arc<dyn ModelLoader>, config: &BridgeConfig) -> Self {
        info!(engine = loader.name(), "Using in-process execution");
        Self {
            state: FacadeState::Unloaded,
            backend: Backend::InProcess {
                loader,
                archive_names: config.model.archive_names.clone(),
                session: None,
            },
            model_dir: None,
        }
    }

    /// Facade that runs models in a worker spawned from `command_line`
    pub fn out_of_process(command_line: &[String], config: &BridgeConfig) -> Result<Self> {
        let channel = ShmChannel::from_config(config)?;
        let worker = WorkerProcess::start(command_line, WorkerOptions::from_config(config))?;
        info!(pid = worker.pid(), shm_dir = %channel.dir().display(), "Using out-of-process execution");
        Ok(Self {
            state: FacadeState::Unloaded,
            backend: Backend::OutOfProcess { worker, channel },
            model_dir: None,
        })
    }

    pub fn state(&self) -> FacadeState {
        self.state
    }

    pub fn is_out_of_process(&self) -> bool {
        matches!(self.backend, Backend::OutOfProcess { .. })
    }

    /// Directory of the loaded model
    pub fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    /// Signature of the loaded model; only known in-process
    pub fn signature(&self) -> Option<&Signature> {
        match &self.backend {
            Backend::InProcess { session, .. } => session.as_ref().map(ModelSession::signature),
            Backend::OutOfProcess { .. } => None,
        }
    }

    /// Pid of the worker process, when there is one
    pub fn worker_pid(&self) -> Option<u32> {
        match &self.backend {
            Backend::OutOfProcess { worker, .. } => Some(worker.pid()),
            Backend::InProcess { .. } => None,
        }
    }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            FacadeState::Closed => Err(BridgeError::invalid_state("execution facade is closed")),
            FacadeState::Defunct => Err(BridgeError::worker_unavailable(
                "worker process crashed; create a new execution facade",
            )),
            _ => Ok(()),
        }
    }

    /// Load the model in `model_dir`, replacing any loaded model.
    ///
    /// On failure the facade is left unloaded.
    pub fn load_model(&mut self, model_dir: impl AsRef<Path>) -> Result<()> {
        self.check_usable()?;
        let model_dir = model_dir.as_ref();
        self.state = FacadeState::Loading;
        self.model_dir = None;

        let result = match &mut self.backend {
            Backend::InProcess {
                loader,
                archive_names,
                session,
            } => {
                if let Some(previous) = session.take() {
                    if let Err(e) = previous.close() {
                        warn!(error = %e, "Failed to close previous model");
                    }
                }
                ModelSession::load(loader.as_ref(), model_dir, archive_names).map(|loaded| {
                    *session = Some(loaded);
                })
            }
            Backend::OutOfProcess { worker, .. } => load_in_worker(worker, model_dir),
        };

        self.state = match &result {
            Ok(()) => {
                info!(model = %model_dir.display(), "Model ready");
                self.model_dir = Some(model_dir.to_path_buf());
                FacadeState::Loaded
            }
            Err(e) if e.is_unrecoverable() => FacadeState::Defunct,
            Err(_) => FacadeState::Unloaded,
        };
        result
    }

    /// Run the loaded model. `outputs` name the tensors to fetch; empty ones
    /// are sized by the model, populated ones give a pre-shaped slot.
    ///
    /// All outputs are populated on success; none are touched on failure.
    pub fn run(&mut self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<()> {
        self.check_usable()?;
        if self.state != FacadeState::Loaded {
            return Err(BridgeError::invalid_state(format!(
                "cannot run while the facade is {}",
                self.state
            )));
        }
        if let Some(empty) = inputs.iter().find(|t| t.is_empty()) {
            return Err(BridgeError::invalid_input(format!("input tensor '{}' has no data", empty.name())));
        }

        self.state = FacadeState::Running;
        METRICS.execution.runs_total.inc();

        let backend = &mut self.backend;
        let result = METRICS.execution.run_duration.time(|| match backend {
            Backend::InProcess { session, .. } => run_in_process(session.as_mut(), inputs, outputs),
            Backend::OutOfProcess { worker, channel } => run_in_worker(worker, channel, inputs, outputs),
        });

        self.state = match &result {
            Err(e) if e.is_unrecoverable() => FacadeState::Defunct,
            _ => FacadeState::Loaded,
        };
        if let Err(e) = &result {
            METRICS.execution.runs_failed.inc();
            warn!(error = %e, "Inference run failed");
        }
        result
    }

    /// Release the model and, out of process, the worker. Safe to call twice.
    pub fn close_model(&mut self) -> Result<()> {
        if self.state == FacadeState::Closed {
            return Ok(());
        }

        let result = match &mut self.backend {
            Backend::InProcess { session, .. } => match session.take() {
                Some(session) => session.close(),
                None => Ok(()),
            },
            Backend::OutOfProcess { worker, .. } => worker.close(),
        };

        self.state = FacadeState::Closed;
        self.model_dir = None;
        debug!("Execution facade closed");
        result
    }
}

impl Drop for ExecutionFacade {
    fn drop(&mut self) {
        if let Err(e) = self.close_model() {
            warn!(error = %e, "Failed to close execution facade");
        }
    }
}

fn load_in_worker(worker: &mut WorkerProcess, model_dir: &Path) -> Result<()> {
    // The worker may run from another working directory
    let model_folder = std::fs::canonicalize(model_dir).unwrap_or_else(|_| model_dir.to_path_buf());
    let mut task = worker.submit(TaskRequest::LoadModel(LoadModelArgs { model_folder }))?;
    task.wait_for();
    task.into_result().map(|_| ())
}

fn run_in_process(session: Option<&mut ModelSession>, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<()> {
    let session = session.ok_or_else(|| BridgeError::invalid_state("no model is loaded"))?;
    let names: Vec<String> = outputs.iter().map(|t| t.name().to_string()).collect();
    let produced = session.run(inputs, &names)?;
    assign_outputs(outputs, produced)
}

fn run_in_worker(
    worker: &mut WorkerProcess,
    channel: &ShmChannel,
    inputs: &[Tensor],
    outputs: &mut [Tensor],
) -> Result<()> {
    let mut scope = channel.scope();
    let result = exchange(worker, channel, &mut scope, inputs, outputs);

    // Outputs are decoded (or the task failed) before anything is released
    let report = scope.release_all();
    report.log();
    debug!(
        released = report.released,
        released_by_reader = report.released_by_reader,
        failures = report.failures.len(),
        "Released request segments"
    );
    result
}

fn exchange(
    worker: &mut WorkerProcess,
    channel: &ShmChannel,
    scope: &mut SegmentScope,
    inputs: &[Tensor],
    outputs: &mut [Tensor],
) -> Result<()> {
    let mut input_descriptors = Vec::with_capacity(inputs.len());
    for tensor in inputs {
        input_descriptors.push(channel.encode_input(tensor, scope)?);
    }
    let mut output_descriptors = Vec::with_capacity(outputs.len());
    for tensor in outputs.iter() {
        output_descriptors.push(channel.encode_output(tensor, scope)?);
    }

    let mut task = worker.submit(TaskRequest::Inference(InferenceArgs {
        inputs: input_descriptors,
        outputs: output_descriptors.clone(),
    }))?;
    task.wait_for();
    let reported = task.into_result()?;

    if reported.len() != outputs.len() {
        return Err(BridgeError::OutputCountMismatch {
            expected: outputs.len(),
            actual: reported.len(),
        });
    }

    let decoded = output_descriptors
        .iter()
        .map(|descriptor| channel.decode(descriptor))
        .collect::<Result<Vec<_>>>()?;
    assign_outputs(outputs, decoded)
}

/// Populate every output at once, after all of them were produced
fn assign_outputs(outputs: &mut [Tensor], produced: Vec<Tensor>) -> Result<()> {
    if produced.len() != outputs.len() {
        return Err(BridgeError::OutputCountMismatch {
            expected: outputs.len(),
            actual: produced.len(),
        });
    }
    for (slot, tensor) in outputs.iter_mut().zip(produced) {
        slot.fill_from(tensor);
    }
    Ok(())
}

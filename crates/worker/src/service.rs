//! Worker-side task loop
//!
//! Reads [`HostMessage`]s line by line, runs tasks one at a time and answers
//! each with a launch message followed by exactly one of completion, failure
//! or cancellation. Protocol traffic owns stdout; logs go to stderr.
//!
//! Thread design:
//! - reader thread: parses lines, records cancel requests, queues executes
//! - service thread: runs queued tasks in order and writes replies

use crate::engine::ModelLoader;
use crate::session::ModelSession;
use crate::shm::ShmChannel;
use crate::tensor::Tensor;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use tensorbridge_common::{cause_chain, BridgeConfig, BridgeError, Result};
use tensorbridge_proto::{
    decode_line, encode_line, HostMessage, InferenceArgs, LoadModelArgs, TaskId, TaskRequest,
    TensorDescriptor, WorkerMessage,
};
use tracing::{debug, error, info, warn};

/// Cancel requests for tasks that have not finished yet
#[derive(Debug, Default)]
struct CancelRequests {
    requested: HashSet<TaskId>,
    /// Highest id that has been answered
    finished: TaskId,
}

impl CancelRequests {
    /// Record a cancel. Returns `false` when the task already finished.
    fn request(&mut self, id: TaskId) -> bool {
        if id <= self.finished {
            return false;
        }
        self.requested.insert(id)
    }

    fn is_requested(&self, id: TaskId) -> bool {
        self.requested.contains(&id)
    }

    /// Forget requests for `id` and anything before it
    fn finish(&mut self, id: TaskId) {
        self.finished = self.finished.max(id);
        let finished = self.finished;
        self.requested.retain(|&pending| pending > finished);
    }
}

type CancelSet = Arc<Mutex<CancelRequests>>;

enum Outcome {
    Completed(Vec<TensorDescriptor>),
    Canceled,
}

/// Serves tasks for one host
pub struct WorkerService {
    loader: Arc<dyn ModelLoader>,
    channel: ShmChannel,
    archive_names: Vec<String>,
    session: Option<ModelSession>,
}

impl WorkerService {
    pub fn new(loader: Arc<dyn ModelLoader>, channel: ShmChannel, archive_names: Vec<String>) -> Self {
        Self {
            loader,
            channel,
            archive_names,
            session: None,
        }
    }

    /// Build a service from configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let loader = crate::engine::loader_for(&config.model.engine)?;
        let channel = ShmChannel::from_config(config)?;
        Ok(Self::new(loader, channel, config.model.archive_names.clone()))
    }

    /// Serve until CLOSE completes or `input` reaches end of file
    pub fn serve<R, W>(mut self, input: R, mut output: W) -> Result<()>
    where
        R: BufRead + Send + 'static,
        W: Write,
    {
        let (task_tx, task_rx): (Sender<(TaskId, TaskRequest)>, Receiver<(TaskId, TaskRequest)>) =
            channel::unbounded();
        let cancels: CancelSet = Arc::new(Mutex::new(CancelRequests::default()));

        let reader_cancels = cancels.clone();
        thread::spawn(move || read_requests(input, task_tx, reader_cancels));

        info!(
            engine = self.loader.name(),
            shm_dir = %self.channel.dir().display(),
            reader_closes_segment = self.channel.reader_closes_segment(),
            "Worker ready"
        );

        for (id, request) in task_rx.iter() {
            let closing = matches!(request, TaskRequest::Close(_));
            self.execute(id, request, &cancels, &mut output)?;
            if closing {
                info!("Close completed, exiting");
                return Ok(());
            }
        }

        info!("Host closed the request stream, exiting");
        self.shutdown();
        Ok(())
    }

    fn execute<W: Write>(&mut self, id: TaskId, request: TaskRequest, cancels: &CancelSet, output: &mut W) -> Result<()> {
        let command = request.command_name();
        debug!(id, command, "Task received");
        send(output, &WorkerMessage::Launch { id })?;

        let is_canceled = || cancels.lock().is_requested(id);

        let result = if is_canceled() {
            Ok(Outcome::Canceled)
        } else {
            match request {
                TaskRequest::LoadModel(args) => self.load(args),
                TaskRequest::Inference(args) => self.infer(args, &is_canceled),
                TaskRequest::Close(_) => self.close(),
            }
        };
        cancels.lock().finish(id);

        let reply = match result {
            Ok(Outcome::Completed(outputs)) => {
                debug!(id, command, "Task completed");
                WorkerMessage::Completion { id, outputs }
            }
            Ok(Outcome::Canceled) => {
                info!(id, command, "Task canceled");
                WorkerMessage::Cancellation { id }
            }
            Err(e) => {
                error!(id, command, error = %e, "Task failed");
                WorkerMessage::Failure {
                    id,
                    error: e.to_string(),
                    causes: cause_chain(&e),
                }
            }
        };
        send(output, &reply)
    }

    fn load(&mut self, args: LoadModelArgs) -> Result<Outcome> {
        if let Some(previous) = self.session.take() {
            if let Err(e) = previous.close() {
                warn!(error = %e, "Failed to close previous model");
            }
        }
        let session = ModelSession::load(self.loader.as_ref(), &args.model_folder, &self.archive_names)?;
        self.session = Some(session);
        Ok(Outcome::Completed(Vec::new()))
    }

    fn infer(&mut self, args: InferenceArgs, is_canceled: &dyn Fn() -> bool) -> Result<Outcome> {
        args.validate().map_err(BridgeError::protocol)?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::invalid_state("no model is loaded"))?;

        let inputs = args
            .inputs
            .iter()
            .map(|descriptor| self.channel.decode(descriptor))
            .collect::<Result<Vec<Tensor>>>()?;
        let output_names: Vec<String> = args.outputs.iter().map(|d| d.name.clone()).collect();

        let results = session.run(&inputs, &output_names)?;
        if is_canceled() {
            return Ok(Outcome::Canceled);
        }

        let written = args
            .outputs
            .iter()
            .zip(&results)
            .map(|(descriptor, tensor)| self.channel.write_output(descriptor, tensor))
            .collect::<Result<Vec<_>>>()?;
        Ok(Outcome::Completed(written))
    }

    fn close(&mut self) -> Result<Outcome> {
        if let Some(session) = self.session.take() {
            session.close()?;
        }
        Ok(Outcome::Completed(Vec::new()))
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!(error = %e, "Failed to close model on shutdown");
            }
        }
    }
}

fn read_requests<R: BufRead>(input: R, tasks: Sender<(TaskId, TaskRequest)>, cancels: CancelSet) {
    for line in input.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to read from host");
                break;
            }
        };

        match decode_line::<HostMessage>(&line) {
            Ok(HostMessage::Execute { id, request }) => {
                if tasks.send((id, request)).is_err() {
                    // Service loop exited
                    break;
                }
            }
            Ok(HostMessage::Cancel { id }) => {
                if cancels.lock().request(id) {
                    debug!(id, "Cancel requested");
                } else {
                    debug!(id, "Ignoring cancel for a finished task");
                }
            }
            Err(e) => {
                error!(error = %e, line = %line, "Failed to parse host message");
            }
        }
    }
    debug!("Request reader exiting");
}

fn send<W: Write>(output: &mut W, message: &WorkerMessage) -> Result<()> {
    let line = encode_line(message)?;
    writeln!(output, "{}", line)?;
    output.flush()?;
    Ok(())
}

/// Serve the process's own stdin and stdout
pub fn serve_stdio(config: &BridgeConfig) -> Result<()> {
    let service = WorkerService::from_config(config)?;
    let stdout = std::io::stdout();
    service.serve(std::io::BufReader::new(std::io::stdin()), stdout.lock())
}

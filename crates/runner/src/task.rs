//! Task handles
//!
//! A [`Task`] tracks one request through QUEUED → RUNNING → a terminal
//! status. Terminal statuses never change; waiting again returns the same
//! status. CRASHED is inferred on the host when the worker dies while the
//! task is outstanding.

use crate::process::{exit_suffix, write_line, ReaderEvent, WorkerProcess};
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::process::ChildStdin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensorbridge_common::{BridgeError, ExecutionError, ExecutionErrorKind, Result, METRICS};
use tensorbridge_proto::{HostMessage, TaskId, TaskStatus, TensorDescriptor, WorkerMessage};
use tracing::{debug, warn};

/// Polls allowed for buffered replies to arrive after the worker exited
const DRAIN_POLLS: usize = 5;

/// An outstanding or finished task
pub struct Task<'w> {
    worker: &'w mut WorkerProcess,
    id: TaskId,
    command: &'static str,
    status: TaskStatus,
    outputs: Vec<TensorDescriptor>,
    error: Option<ExecutionError>,
    submitted_at: Instant,
}

impl<'w> Task<'w> {
    pub(crate) fn new(worker: &'w mut WorkerProcess, id: TaskId, command: &'static str) -> Self {
        Self {
            worker,
            id,
            command,
            status: TaskStatus::Queued,
            outputs: Vec::new(),
            error: None,
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    /// Status as of the last wait
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Output descriptors reported by the worker, once COMPLETED
    pub fn outputs(&self) -> Option<&[TensorDescriptor]> {
        (self.status == TaskStatus::Completed).then_some(self.outputs.as_slice())
    }

    /// Error for FAILED, CANCELED and CRASHED tasks
    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    /// Block until the task reaches a terminal status
    pub fn wait_for(&mut self) -> TaskStatus {
        self.pump(None);
        self.status
    }

    /// Block for at most `timeout`. The returned status may be non-terminal.
    pub fn wait_for_timeout(&mut self, timeout: Duration) -> TaskStatus {
        self.pump(Some(Instant::now() + timeout));
        self.status
    }

    /// Ask the worker to cancel this task. No-op once terminal.
    pub fn cancel(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Ok(());
        }
        write_line(&self.worker.stdin, &HostMessage::Cancel { id: self.id })
            .map_err(|e| BridgeError::worker_unavailable(format!("Failed to send cancel: {}", e)))
    }

    /// Interpret the terminal status: output descriptors for COMPLETED, the
    /// wrapped execution error otherwise
    pub fn into_result(mut self) -> Result<Vec<TensorDescriptor>> {
        match self.status {
            TaskStatus::Completed => Ok(std::mem::take(&mut self.outputs)),
            status if status.is_terminal() => Err(self
                .error
                .take()
                .unwrap_or_else(|| ExecutionError::new(ExecutionErrorKind::Failed, vec![status.to_string()]))
                .into()),
            status => Err(BridgeError::invalid_state(format!(
                "task {} ({}) is still {}",
                self.id, self.command, status
            ))),
        }
    }

    fn pump(&mut self, deadline: Option<Instant>) {
        let poll = self.worker.options.poll_interval;

        while !self.status.is_terminal() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            match self.worker.events.recv_timeout(wait) {
                Ok(ReaderEvent::Message(message)) => self.apply(message),
                Ok(ReaderEvent::Eof) => self.crash("worker closed its output stream"),
                Err(RecvTimeoutError::Disconnected) => self.crash("worker reader thread stopped"),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.worker.is_alive() {
                        self.drain_after_exit();
                    }
                }
            }
        }
    }

    /// The child exited; take whatever it wrote before dying, then give up
    fn drain_after_exit(&mut self) {
        let poll = self.worker.options.poll_interval;
        for _ in 0..DRAIN_POLLS {
            match self.worker.events.recv_timeout(poll) {
                Ok(ReaderEvent::Message(message)) => {
                    self.apply(message);
                    if self.status.is_terminal() {
                        return;
                    }
                }
                Ok(ReaderEvent::Eof) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.crash("worker process exited");
    }

    fn apply(&mut self, message: WorkerMessage) {
        if message.id() != self.id {
            debug!(expected = self.id, got = message.id(), "Ignoring reply for another task");
            return;
        }

        match message {
            WorkerMessage::Launch { .. } => {
                if self.status == TaskStatus::Queued {
                    self.status = TaskStatus::Running;
                }
            }
            WorkerMessage::Completion { outputs, .. } => {
                self.outputs = outputs;
                self.finish(TaskStatus::Completed);
            }
            WorkerMessage::Failure { error, causes, .. } => {
                let causes = if causes.is_empty() { vec![error] } else { causes };
                self.error = Some(ExecutionError::new(ExecutionErrorKind::Failed, causes));
                self.finish(TaskStatus::Failed);
            }
            WorkerMessage::Cancellation { .. } => {
                self.error = Some(ExecutionError::new(
                    ExecutionErrorKind::Canceled,
                    vec![format!("task {} ({}) was canceled", self.id, self.command)],
                ));
                self.finish(TaskStatus::Canceled);
            }
        }
    }

    fn crash(&mut self, reason: &str) {
        let exit = self.worker.invalidate();
        warn!(id = self.id, command = self.command, reason, "Task lost to worker crash");
        self.error = Some(ExecutionError::new(
            ExecutionErrorKind::Crashed,
            vec![
                format!(
                    "worker process terminated while task {} ({}) was outstanding",
                    self.id, self.command
                ),
                format!("{}{}", reason, exit_suffix(exit)),
            ],
        ));
        self.finish(TaskStatus::Crashed);
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        let _ = self
            .worker
            .current
            .compare_exchange(self.id, 0, Ordering::SeqCst, Ordering::SeqCst);

        let tasks = &METRICS.tasks;
        match status {
            TaskStatus::Completed => tasks.completed.inc(),
            TaskStatus::Failed => tasks.failed.inc(),
            TaskStatus::Canceled => tasks.canceled.inc(),
            TaskStatus::Crashed => tasks.crashed.inc(),
            TaskStatus::Queued | TaskStatus::Running => {}
        }
        tasks.duration.observe(self.submitted_at.elapsed().as_secs_f64());
        debug!(id = self.id, command = self.command, status = %status, "Task finished");
    }
}

impl Drop for Task<'_> {
    fn drop(&mut self) {
        if !self.status.is_terminal() {
            debug!(id = self.id, command = self.command, status = %self.status, "Task dropped while outstanding");
            self.worker.abandoned = Some(self.id);
        }
    }
}

/// Cancels whichever task is outstanding on a worker. Cloneable and usable
/// from any thread.
#[derive(Clone)]
pub struct Canceller {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    current: Arc<AtomicU64>,
}

impl Canceller {
    pub(crate) fn new(stdin: Arc<Mutex<Option<ChildStdin>>>, current: Arc<AtomicU64>) -> Self {
        Self { stdin, current }
    }

    /// Request cancellation of the outstanding task. Returns `false` when no
    /// task is outstanding.
    pub fn cancel(&self) -> Result<bool> {
        let id = self.current.load(Ordering::SeqCst);
        if id == 0 {
            return Ok(false);
        }
        write_line(&self.stdin, &HostMessage::Cancel { id })
            .map_err(|e| BridgeError::worker_unavailable(format!("Failed to send cancel: {}", e)))?;
        debug!(id, "Cancel sent");
        Ok(true)
    }
}

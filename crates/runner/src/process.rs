//! Worker process lifecycle management
//!
//! Spawns a worker child process, feeds it tasks over stdin and collects
//! replies from stdout on a reader thread. The handle stays valid until it
//! is closed or the worker dies; a dead worker is never restarted here, the
//! owner decides whether to spawn a new one.

use crate::task::{Canceller, Task};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tensorbridge_common::config::{READER_CLOSES_SEGMENT_ENV, SHM_DIR_ENV};
use tensorbridge_common::{BridgeConfig, BridgeError, ExecutionError, ExecutionErrorKind, Result, METRICS};
use tensorbridge_proto::{decode_line, encode_line, HostMessage, TaskId, TaskRequest, WorkerMessage};
use tracing::{debug, info, warn};

/// How a worker process is spawned and supervised
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Extra environment for the child
    pub env: Vec<(String, String)>,

    /// Time allowed for a clean exit before the worker is killed
    pub shutdown_grace: Duration,

    /// How often a blocked wait checks whether the worker is alive
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerOptions {
    /// Options from configuration. The resolved segment directory and
    /// ownership rule are handed to the worker so both sides agree.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut env: Vec<(String, String)> = config
            .worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((SHM_DIR_ENV.to_string(), config.segment_dir().to_string_lossy().into_owned()));
        env.push((
            READER_CLOSES_SEGMENT_ENV.to_string(),
            config.reader_closes_segment().to_string(),
        ));

        Self {
            env,
            shutdown_grace: config.shutdown_grace(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Validity of a worker handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Ready,
    /// The worker died; the handle is torn down
    Crashed,
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleState::Ready => write!(f, "ready"),
            HandleState::Crashed => write!(f, "crashed"),
            HandleState::Closed => write!(f, "closed"),
        }
    }
}

/// What the reader thread saw on the worker's stdout
#[derive(Debug)]
pub(crate) enum ReaderEvent {
    Message(WorkerMessage),
    /// Stdout reached end of file
    Eof,
}

/// Handle to one worker process
pub struct WorkerProcess {
    child: Option<Child>,
    pid: u32,
    pub(crate) stdin: Arc<Mutex<Option<ChildStdin>>>,
    pub(crate) events: Receiver<ReaderEvent>,
    /// Id of the outstanding task, 0 when idle
    pub(crate) current: Arc<AtomicU64>,
    /// Task dropped before its terminal reply arrived
    pub(crate) abandoned: Option<TaskId>,
    pub(crate) options: WorkerOptions,
    state: HandleState,
    next_id: TaskId,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("next_id", &self.next_id)
            .field("abandoned", &self.abandoned)
            .finish()
    }
}

/// Serialize one message and write it as a line
pub(crate) fn write_line(stdin: &Mutex<Option<ChildStdin>>, message: &HostMessage) -> io::Result<()> {
    let line = encode_line(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut guard = stdin.lock();
    let pipe = guard
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed"))?;
    writeln!(pipe, "{}", line)?;
    pipe.flush()
}

fn read_replies(stdout: ChildStdout, events: Sender<ReaderEvent>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                debug!(error = %e, "Worker stdout read failed");
                break;
            }
        };
        match decode_line::<WorkerMessage>(&line) {
            Ok(message) => {
                if events.send(ReaderEvent::Message(message)).is_err() {
                    // Handle dropped
                    return;
                }
            }
            Err(e) => warn!(error = %e, line = %line, "Ignoring unparseable worker output"),
        }
    }
    let _ = events.send(ReaderEvent::Eof);
}

impl WorkerProcess {
    /// Spawn `command_line[0]` with the remaining entries as arguments
    pub fn start(command_line: &[String], options: WorkerOptions) -> Result<Self> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| BridgeError::config("Worker command line is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BridgeError::worker_unavailable(format!("Failed to spawn worker {}: {}", program, e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BridgeError::worker_unavailable("Worker pipes are not available"));
            }
        };

        let (event_tx, event_rx) = channel::unbounded();
        let spawned = thread::Builder::new()
            .name(format!("tensorbridge-reader-{}", pid))
            .spawn(move || read_replies(stdout, event_tx));
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::worker_unavailable(format!("Failed to start reader thread: {}", e)));
        }

        METRICS.execution.workers_spawned.inc();
        METRICS.execution.active_workers.inc();
        info!(pid, program = %program, "Worker process started");

        Ok(Self {
            child: Some(child),
            pid,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            events: event_rx,
            current: Arc::new(AtomicU64::new(0)),
            abandoned: None,
            options,
            state: HandleState::Ready,
            next_id: 1,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Whether tasks can still be submitted
    pub fn is_valid(&self) -> bool {
        self.state == HandleState::Ready
    }

    /// Whether a task dropped before finishing is still running on the
    /// worker. Consumes whatever replies already arrived for it.
    pub fn is_busy(&mut self) -> bool {
        self.settle(Instant::now())
    }

    /// Wait until `deadline` for the abandoned task to reach a terminal
    /// status. Returns `true` while it is still running.
    fn settle(&mut self, deadline: Instant) -> bool {
        while let Some(id) = self.abandoned {
            match self.events.recv_deadline(deadline) {
                Ok(ReaderEvent::Message(message)) => {
                    if message.id() == id && message.status().is_terminal() {
                        debug!(pid = self.pid, id, status = %message.status(), "Abandoned task finished");
                        self.abandoned = None;
                        let _ = self.current.compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
                    }
                }
                Ok(ReaderEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    self.abandoned = None;
                    METRICS.tasks.crashed.inc();
                    self.invalidate();
                }
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
        false
    }

    /// Send a task to the worker. The returned [`Task`] borrows the handle,
    /// so at most one task is outstanding at a time. A task dropped before
    /// its terminal reply keeps the worker busy until that reply is drained.
    pub fn submit(&mut self, request: TaskRequest) -> Result<Task<'_>> {
        if self.is_busy() {
            return Err(BridgeError::invalid_state(format!(
                "worker {} is still running task {}",
                self.pid,
                self.abandoned.unwrap_or_default()
            )));
        }
        if self.state != HandleState::Ready {
            return Err(BridgeError::worker_unavailable(format!(
                "worker {} is {}",
                self.pid, self.state
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        let command = request.command_name();

        if let Err(e) = write_line(&self.stdin, &HostMessage::Execute { id, request }) {
            let exit = self.invalidate();
            METRICS.tasks.crashed.inc();
            return Err(ExecutionError::new(
                ExecutionErrorKind::Crashed,
                vec![
                    format!("worker process is gone, could not submit task {} ({})", id, command),
                    format!("{}{}", e, exit_suffix(exit)),
                ],
            )
            .into());
        }

        METRICS.tasks.submitted.inc();
        self.current.store(id, Ordering::SeqCst);
        debug!(pid = self.pid, id, command, "Task submitted");
        Ok(Task::new(self, id, command))
    }

    /// Cancellation handle usable from other threads while a task is waited on
    pub fn canceller(&self) -> Canceller {
        Canceller::new(self.stdin.clone(), self.current.clone())
    }

    /// Whether the child process is still running
    pub(crate) fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Tear the handle down after the worker died. Returns the exit status
    /// when it could be collected.
    pub(crate) fn invalidate(&mut self) -> Option<ExitStatus> {
        self.current.store(0, Ordering::SeqCst);
        self.abandoned = None;
        self.stdin.lock().take();

        let status = self.child.take().and_then(|mut child| {
            let _ = child.kill();
            child.wait().ok()
        });

        if self.state == HandleState::Ready {
            METRICS.execution.active_workers.dec();
            warn!(pid = self.pid, status = ?status, "Worker process terminated unexpectedly");
            self.state = HandleState::Crashed;
        }
        status
    }

    /// Send CLOSE, wait for the worker to exit, and release the handle.
    /// Closing an invalid handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state != HandleState::Ready {
            return Ok(());
        }

        if let Some(id) = self.abandoned {
            if let Err(e) = write_line(&self.stdin, &HostMessage::Cancel { id }) {
                debug!(pid = self.pid, id, error = %e, "Failed to cancel abandoned task");
            }
            if self.settle(Instant::now() + self.options.shutdown_grace) {
                warn!(pid = self.pid, id, "Worker still busy, shutting down without CLOSE");
                self.shutdown();
                return Ok(());
            }
            if self.state != HandleState::Ready {
                return Ok(());
            }
        }

        let result = match self.submit(TaskRequest::close()) {
            Ok(mut task) => {
                task.wait_for();
                task.into_result().map(|_| ())
            }
            Err(e) => Err(e),
        };
        let result = match result {
            Err(e) if e.is_unrecoverable() => {
                warn!(pid = self.pid, error = %e, "Worker exited before acknowledging close");
                Ok(())
            }
            other => other,
        };

        self.shutdown();
        result
    }

    /// Close stdin, give the worker the grace period to exit, then kill it
    fn shutdown(&mut self) {
        self.stdin.lock().take();

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + self.options.shutdown_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = self.pid, status = %status, "Worker exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                    _ => {
                        warn!(pid = self.pid, "Worker did not exit within the grace period, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }

        if self.state == HandleState::Ready {
            METRICS.execution.active_workers.dec();
        }
        self.state = HandleState::Closed;
        info!(pid = self.pid, "Worker process closed");
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if self.state == HandleState::Ready {
            METRICS.execution.active_workers.dec();
        }
    }
}

/// Human-readable suffix for an exit status
pub(crate) fn exit_suffix(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!(" ({})", status),
        None => String::new(),
    }
}

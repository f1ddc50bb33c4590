//! Calling side of the process pool.
//!
//! A [`WorkerHandle`] owns one worker process and its two pipes. A [`WorkerPool`]
//! keeps idle handles around so consecutive work items skip the process start.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use crate::error::{Error, Result, TaskError};
use crate::registry::FunctionId;

use super::WORKER_ENV;
use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

/// Time a worker gets to act on `Shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(10);

/// One worker process speaking the IPC protocol over its stdin and stdout.
pub struct WorkerHandle {
    child: Child,
    commands: BufWriter<ChildStdin>,
    responses: BufReader<ChildStdout>,
    /// Set once the process has been told to stop.
    stopped: bool,
}

impl WorkerHandle {
    /// Start `program` in worker mode and check that it answers.
    pub fn spawn(program: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker logs and task output go to our stderr.
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "cannot start worker '{}': {}",
                    program.display(),
                    e
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(Error::Ipc("worker pipes were not set up".to_string()));
        };

        let mut worker = Self {
            child,
            commands: BufWriter::new(stdin),
            responses: BufReader::new(stdout),
            stopped: false,
        };

        match worker.exchange(&WorkerCommand::Ping)? {
            WorkerResponse::Pong => {
                tracing::debug!("Worker {} started from '{}'", worker.pid(), program.display());
                Ok(worker)
            }
            other => Err(Error::Ipc(format!(
                "worker {} answered the ping with {:?}",
                worker.pid(),
                other
            ))),
        }
    }

    /// Resolve the program to launch as a worker.
    ///
    /// Uses `configured` when given (bare names are looked up on `PATH`),
    /// otherwise the current executable.
    pub fn locate(configured: Option<&Path>) -> Result<PathBuf> {
        match configured {
            Some(path) if path.exists() => Ok(path.to_path_buf()),
            Some(path) if path.components().count() == 1 => which::which(path).map_err(|e| {
                Error::ProcessPool(format!(
                    "worker program '{}' not found on PATH: {}",
                    path.display(),
                    e
                ))
            }),
            Some(path) => Err(Error::ProcessPool(format!(
                "worker program '{}' does not exist",
                path.display()
            ))),
            None => std::env::current_exe().map_err(|e| {
                Error::ProcessPool(format!("cannot determine current executable: {}", e))
            }),
        }
    }

    /// Send `command` and wait for the matching response.
    fn exchange(&mut self, command: &WorkerCommand) -> Result<WorkerResponse> {
        if self.stopped {
            return Err(Error::Ipc(format!("worker {} was stopped", self.pid())));
        }
        write_message(&mut self.commands, command)?;
        read_message(&mut self.responses)
    }

    /// Run `function` with encoded `args` in the worker.
    ///
    /// Returns the encoded return value. Task failures come back as `Error::Task`,
    /// transport failures as `Error::Ipc` or `Error::Disconnected`.
    pub fn call(&mut self, function: &FunctionId, args: Vec<u8>) -> Result<Vec<u8>> {
        let command = WorkerCommand::Call {
            module: function.module.clone(),
            function: function.name.clone(),
            args,
        };

        match self.exchange(&command)? {
            WorkerResponse::Return { value } => Ok(value),
            WorkerResponse::Raised { message } => Err(TaskError::remote(message).into()),
            WorkerResponse::Panicked { message } => Err(TaskError::panicked_with(message).into()),
            WorkerResponse::UnknownFunction { module, function } => Err(Error::UnknownFunction(
                FunctionId::new(module, function).to_string(),
            )),
            other => Err(Error::Ipc(format!(
                "worker answered a call to {} with {:?}",
                function, other
            ))),
        }
    }

    /// Ask the worker to exit, then kill and reap it. Idempotent.
    pub fn stop(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }

        let _ = write_message(&mut self.commands, &WorkerCommand::Shutdown);
        std::thread::sleep(SHUTDOWN_GRACE);

        match self.child.kill() {
            Ok(()) => {}
            // The worker already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => tracing::warn!("Cannot kill worker {}: {}", self.pid(), e),
        }
        let _ = self.child.wait();
    }

    /// Whether the process is running and has not been stopped.
    pub fn is_running(&mut self) -> bool {
        !self.stopped && matches!(self.child.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Idle workers waiting for the next work item.
pub struct WorkerPool {
    program: PathBuf,
    idle: Vec<WorkerHandle>,
    /// Idle workers beyond this count are stopped when returned.
    capacity: usize,
}

impl WorkerPool {
    /// Create an empty pool launching `program`.
    pub fn new(program: PathBuf, capacity: usize) -> Self {
        Self {
            program,
            idle: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Program launched for new workers.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Take an idle worker that is still running, discarding dead ones.
    pub fn take_idle(&mut self) -> Option<WorkerHandle> {
        std::iter::from_fn(|| self.idle.pop())
            .find_map(|mut worker| worker.is_running().then_some(worker))
    }

    /// Hand a worker back after a completed call.
    ///
    /// Dead workers, and workers beyond the capacity, are dropped (and so stopped).
    pub fn put(&mut self, mut worker: WorkerHandle) {
        if worker.is_running() && self.idle.len() < self.capacity {
            self.idle.push(worker);
        }
    }

    /// Stop every idle worker.
    pub fn shutdown(&mut self) {
        for mut worker in self.idle.drain(..) {
            worker.stop();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

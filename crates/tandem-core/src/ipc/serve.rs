//! Worker side of the process pool.
//!
//! A worker process is the application's own executable started with
//! `TANDEM_WORKER=1`. Calling [`run_if_worker`] first thing in `main` turns such a
//! process into a server that answers `Call` commands from its registry.

use std::io::{BufReader, BufWriter, Read, Write};

use crate::error::{Error, Result};
use crate::registry::{FunctionId, InvokeError, Registry};

use super::WORKER_ENV;
use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

/// Environment variable with the worker's log filter.
pub const WORKER_LOG_ENV: &str = "TANDEM_LOG";

/// Whether the current process was started as a worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|value| value == "1")
}

/// Serve work items and exit if this process is a worker; return otherwise.
pub fn run_if_worker(registry: &Registry) {
    if !is_worker_process() {
        return;
    }

    init_logging();
    let code = match serve_stdio(registry) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Worker {} stopped: {}", std::process::id(), e);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(WORKER_LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn serve_stdio(registry: &Registry) -> Result<()> {
    let protocol_out = claim_stdout()?;
    let stdin = std::io::stdin().lock();
    serve(registry, BufReader::new(stdin), BufWriter::new(protocol_out))
}

/// Take the protocol stream off fd 1 and point fd 1 at stderr, so that anything a
/// task prints cannot interleave with protocol messages.
#[cfg(unix)]
fn claim_stdout() -> Result<std::fs::File> {
    use std::fs::File;
    use std::os::fd::FromRawFd;

    // SAFETY: plain descriptor duplication; the new descriptor is owned by the File.
    unsafe {
        let protocol = libc::dup(libc::STDOUT_FILENO);
        if protocol < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(File::from_raw_fd(protocol))
    }
}

#[cfg(not(unix))]
fn claim_stdout() -> Result<std::io::Stdout> {
    Ok(std::io::stdout())
}

/// Answer commands from `input` on `output` until `Shutdown` or end of input.
pub fn serve<R: Read, W: Write>(registry: &Registry, mut input: R, mut output: W) -> Result<()> {
    tracing::debug!(
        "Worker {} serving {} functions",
        std::process::id(),
        registry.len()
    );

    loop {
        let command = match read_message::<_, WorkerCommand>(&mut input) {
            Ok(command) => command,
            // The parent went away: nothing left to serve.
            Err(Error::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match command {
            WorkerCommand::Ping => WorkerResponse::Pong,
            WorkerCommand::Shutdown => {
                write_message(&mut output, &WorkerResponse::ShuttingDown)?;
                return Ok(());
            }
            WorkerCommand::Call {
                module,
                function,
                args,
            } => call(registry, FunctionId::new(module, function), &args),
        };
        write_message(&mut output, &response)?;
    }
}

fn call(registry: &Registry, id: FunctionId, args: &[u8]) -> WorkerResponse {
    tracing::debug!("Worker {} running {}", std::process::id(), id);
    match registry.invoke(&id, args) {
        Some(Ok(value)) => WorkerResponse::Return { value },
        Some(Err(InvokeError::Panicked(message))) => WorkerResponse::Panicked { message },
        Some(Err(InvokeError::Raised(message))) => WorkerResponse::Raised { message },
        Some(Err(InvokeError::BadArguments(message))) => WorkerResponse::Raised {
            message: format!("cannot decode arguments for {}: {}", id, message),
        },
        Some(Err(InvokeError::BadOutput(message))) => WorkerResponse::Raised {
            message: format!("cannot encode result of {}: {}", id, message),
        },
        None => {
            tracing::warn!("No function registered as {}", id);
            WorkerResponse::UnknownFunction {
                module: id.module,
                function: id.name,
            }
        }
    }
}

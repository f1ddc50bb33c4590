//! Inter-process communication with worker processes.
//!
//! `protocol` defines the messages, `worker` manages worker processes from the
//! calling side and `serve` is the loop running inside a worker.

pub mod protocol;
mod serve;
mod worker;

pub use protocol::{WorkerCommand, WorkerResponse, read_message, write_message};
pub use serve::{WORKER_LOG_ENV, is_worker_process, run_if_worker, serve};
pub use worker::{WorkerHandle, WorkerPool};

/// Environment variable marking a process as a worker.
pub const WORKER_ENV: &str = "TANDEM_WORKER";

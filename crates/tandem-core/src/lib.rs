//! Core runtime for Tandem.
//!
//! This crate provides:
//! - The runtime owning the loop thread, the thread pool and the process pool
//! - The dispatcher selecting where a call runs
//! - `Unfuture`, the future awaitable from the loop and blockable from other threads
//! - Continuations chained onto an `Unfuture`
//! - The registry and IPC used by worker processes

pub mod config;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod ipc;
pub mod registry;
pub mod runtime;

pub use config::RuntimeConfig;
pub use dispatch::{Call, DispatchMode, FunctionKind, TaskDef, TaskOptions};
pub use error::{Error, Result, TaskError};
pub use future::{Origin, Unfuture};
pub use registry::{FunctionId, InvokeError, Registry, RemoteTask};
pub use runtime::{LoopHandle, ProcessPool, Runtime, RuntimeStats, WorkItem};

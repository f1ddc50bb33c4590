//! Error types for tandem-core.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type for tandem-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core.
///
/// Errors are `Clone` because a settled [`crate::Unfuture`] hands the same outcome to
/// every observer, on both of its handles.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid task declaration, e.g. a cooperative function marked `cpu_bound`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A blocking wait was attempted on the loop thread for an unresolved future.
    #[error("cannot block the loop thread on an unresolved future; await it instead")]
    UnsafeWait,

    /// The task itself failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Handing the outcome over between the cooperative and blocking handles failed.
    #[error("propagation error: {0}")]
    Propagation(String),

    /// `result()` gave up waiting. The task keeps running.
    #[error("timed out after {0:?} waiting for result")]
    Timeout(Duration),

    /// The loop thread is no longer accepting callbacks.
    #[error("event loop is closed")]
    LoopClosed,

    /// The process pool could not be created.
    #[error("process pool unavailable: {0}")]
    ProcessPool(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The other end of a worker pipe closed.
    #[error("worker pipe closed")]
    Disconnected,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A worker process has no function registered under this identifier.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Convert an error raised by task code.
    ///
    /// A `tandem_core::Error` travelling inside the `anyhow::Error` (for instance a
    /// continuation that did `source.result()?`) is passed through unchanged.
    pub fn from_task(err: impl Into<anyhow::Error>) -> Self {
        match err.into().downcast::<Error>() {
            Ok(err) => err,
            Err(other) => Error::Task(TaskError::new(other)),
        }
    }

    /// Returns the task error, if this is one.
    pub fn as_task(&self) -> Option<&TaskError> {
        match self {
            Error::Task(err) => Some(err),
            _ => None,
        }
    }
}

/// Error raised by the wrapped function itself.
#[derive(Clone, Error)]
#[error("{inner}")]
pub struct TaskError {
    inner: Arc<anyhow::Error>,
    panicked: bool,
}

impl TaskError {
    /// Wrap an error returned by a task.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(err.into()),
            panicked: false,
        }
    }

    /// Error reported by a worker process, which only carries the message across.
    pub fn remote(message: impl fmt::Display) -> Self {
        Self::new(anyhow::anyhow!("{message}"))
    }

    /// Build from a caught panic payload.
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Self::panicked_with(panic_message(payload.as_ref()))
    }

    /// Build from a panic message, e.g. one reported by a worker process.
    pub fn panicked_with(message: impl fmt::Display) -> Self {
        Self {
            inner: Arc::new(anyhow::anyhow!("task panicked: {message}")),
            panicked: true,
        }
    }

    /// Whether the task panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// Attempt to view the original error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskError")
            .field("error", &format_args!("{:#}", self.inner))
            .field("panicked", &self.panicked)
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

//! Function registry used by worker processes.
//!
//! A process-pool call only carries a [`FunctionId`] and the encoded arguments. The
//! worker resolves the identifier against a [`Registry`] populated at startup, invokes
//! the function and sends the encoded result back.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, panic_message};

/// Stable identifier of a function across processes: its owning module and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// Module path, as produced by `module_path!()`.
    pub module: String,
    /// Function name.
    pub name: String,
}

impl FunctionId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// A function that can be executed in a worker process.
///
/// Implemented by `#[tandem::task(cpu_bound)]` for the generated marker type.
pub trait RemoteTask: 'static {
    /// Argument tuple, sent to the worker.
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// Return value, sent back to the caller.
    type Output: Serialize + DeserializeOwned + Clone + Send + 'static;

    /// Identifier the worker resolves.
    fn id() -> FunctionId;

    /// Run the function in the current process.
    fn invoke(args: Self::Args) -> Result<Self::Output, Error>;
}

/// Failure of a registered function, as reported back to the calling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// Arguments could not be decoded.
    BadArguments(String),
    /// The function returned an error.
    Raised(String),
    /// The function panicked.
    Panicked(String),
    /// The return value could not be encoded.
    BadOutput(String),
}

type Handler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, InvokeError> + Send + Sync>;

/// Maps [`FunctionId`]s to callable handlers.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: FxHashMap<FunctionId, Handler>,
    module_aliases: FxHashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task generated by `#[tandem::task(cpu_bound)]`.
    pub fn register<R: RemoteTask>(&mut self) -> &mut Self {
        self.register_fn(R::id(), |args: R::Args| R::invoke(args))
    }

    /// Builder-style [`Registry::register`].
    pub fn with<R: RemoteTask>(mut self) -> Self {
        self.register::<R>();
        self
    }

    /// Register a plain function under `id`. Arguments arrive as one serde value,
    /// usually a tuple.
    pub fn register_fn<A, T, E, F>(&mut self, id: FunctionId, function: F) -> &mut Self
    where
        A: DeserializeOwned,
        T: Serialize,
        E: Into<anyhow::Error>,
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |bytes: &[u8]| {
            let args: A = serde_json::from_slice(bytes)
                .map_err(|e| InvokeError::BadArguments(e.to_string()))?;
            let output = match catch_unwind(AssertUnwindSafe(|| function(args))) {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => return Err(InvokeError::Raised(format!("{:#}", err.into()))),
                Err(payload) => return Err(InvokeError::Panicked(panic_message(payload.as_ref()))),
            };
            serde_json::to_vec(&output).map_err(|e| InvokeError::BadOutput(e.to_string()))
        });
        tracing::debug!("Registered remote function {}", id);
        self.handlers.insert(id, handler);
        self
    }

    /// Resolve functions registered under module `to` when a caller names module `from`.
    ///
    /// Covers module paths that differ between the calling and the worker process.
    pub fn alias_module(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.module_aliases.insert(from.into(), to.into());
        self
    }

    /// Whether `id` resolves to a handler.
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.resolve(id).is_some()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn resolve(&self, id: &FunctionId) -> Option<&Handler> {
        if let Some(handler) = self.handlers.get(id) {
            return Some(handler);
        }
        let module = self.module_aliases.get(&id.module)?;
        self.handlers.get(&FunctionId::new(module.clone(), id.name.clone()))
    }

    /// Invoke the function registered under `id` with encoded arguments.
    ///
    /// Returns `None` if nothing is registered under `id`.
    pub fn invoke(&self, id: &FunctionId, args: &[u8]) -> Option<Result<Vec<u8>, InvokeError>> {
        self.resolve(id).map(|handler| handler(args))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.handlers.keys().collect::<Vec<_>>())
            .field("module_aliases", &self.module_aliases)
            .finish()
    }
}

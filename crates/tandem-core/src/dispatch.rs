//! Dispatching calls to the loop thread, the thread pool or the process pool.
//!
//! A [`TaskDef`] describes a declared function: its [`FunctionId`], whether it is
//! cooperative and its [`TaskOptions`]. From these a [`DispatchMode`] is selected once.
//! A [`Call`] is one bound invocation of that function. [`Runtime::dispatch`] routes
//! the call and returns an [`Unfuture`] without waiting for the body to run.

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result, TaskError};
use crate::future::{Origin, Unfuture};
use crate::registry::{FunctionId, RemoteTask};
use crate::runtime::{Runtime, WorkItem};

/// Whether a function contains suspension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// An `async fn`, run on the loop thread.
    Cooperative,
    /// An ordinary function.
    Plain,
}

/// Options accepted by `#[tandem::task(...)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskOptions {
    /// Run in a worker process instead of on the thread pool.
    pub cpu_bound: bool,
}

/// Where a call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the loop thread's scheduler.
    Cooperative,
    /// On the worker-thread pool.
    Thread,
    /// In a worker process.
    Process,
}

impl DispatchMode {
    /// Select the mode for a function of `kind` declared with `options`.
    ///
    /// A cooperative function cannot be `cpu_bound`.
    pub fn select(kind: FunctionKind, options: TaskOptions, id: &FunctionId) -> Result<Self> {
        match (kind, options.cpu_bound) {
            (FunctionKind::Cooperative, false) => Ok(DispatchMode::Cooperative),
            (FunctionKind::Cooperative, true) => Err(Error::Configuration(format!(
                "cooperative function {} may not be cpu_bound",
                id
            ))),
            (FunctionKind::Plain, false) => Ok(DispatchMode::Thread),
            (FunctionKind::Plain, true) => Ok(DispatchMode::Process),
        }
    }
}

/// A declared task function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDef {
    id: FunctionId,
    kind: FunctionKind,
    options: TaskOptions,
}

impl TaskDef {
    /// An `async` function.
    pub fn cooperative(id: FunctionId) -> Self {
        Self {
            id,
            kind: FunctionKind::Cooperative,
            options: TaskOptions::default(),
        }
    }

    /// An ordinary function.
    pub fn plain(id: FunctionId) -> Self {
        Self {
            id,
            kind: FunctionKind::Plain,
            options: TaskOptions::default(),
        }
    }

    pub fn cpu_bound(mut self, cpu_bound: bool) -> Self {
        self.options.cpu_bound = cpu_bound;
        self
    }

    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn options(&self) -> TaskOptions {
        self.options
    }

    /// The dispatch mode, or a configuration error for illegal combinations.
    pub fn mode(&self) -> Result<DispatchMode> {
        DispatchMode::select(self.kind, self.options, &self.id)
    }
}

/// One bound invocation of a task, ready to be dispatched.
pub struct Call<T> {
    body: Body<T>,
}

enum Body<T> {
    Cooperative(BoxFuture<'static, Result<T>>),
    Plain(Box<dyn FnOnce() -> Result<T> + Send + 'static>),
    Remote {
        item: Result<WorkItem>,
        decode: fn(&[u8]) -> Result<T>,
    },
}

impl<T> Body<T> {
    fn describe(&self) -> &'static str {
        match self {
            Body::Cooperative(_) => "cooperative",
            Body::Plain(_) => "plain",
            Body::Remote { .. } => "remote",
        }
    }
}

impl<T: Send + 'static> Call<T> {
    /// The body of an `async fn`.
    pub fn cooperative<F>(task: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            body: Body::Cooperative(task.map(Ok).boxed()),
        }
    }

    /// The body of an `async fn` returning a `Result`.
    pub fn cooperative_fallible<F, E>(task: F) -> Self
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        Self {
            body: Body::Cooperative(task.map(|out| out.map_err(Error::from_task)).boxed()),
        }
    }

    /// The body of an ordinary function.
    pub fn plain<F>(function: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            body: Body::Plain(Box::new(move || Ok(function()))),
        }
    }

    /// The body of an ordinary function returning a `Result`.
    pub fn plain_fallible<F, E>(function: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        Self {
            body: Body::Plain(Box::new(move || function().map_err(Error::from_task))),
        }
    }

    /// A call of the registered function `R`, executed by a worker process.
    pub fn remote<R>(args: R::Args) -> Self
    where
        R: RemoteTask<Output = T>,
        T: DeserializeOwned,
    {
        let item = serde_json::to_vec(&args)
            .map(|args| WorkItem {
                function: R::id(),
                args,
            })
            .map_err(|e| Error::Serialization(format!("arguments of {}: {}", R::id(), e)));
        Self {
            body: Body::Remote {
                item,
                decode: decode_json::<T>,
            },
        }
    }
}

impl<T> fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("body", &self.body.describe())
            .finish()
    }
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

impl Runtime {
    /// Dispatch `call` according to `def` and return its future immediately.
    ///
    /// Fails without scheduling anything if `def` is an illegal combination, if the
    /// call's shape does not match the selected mode, or if the process pool cannot be
    /// created.
    pub fn dispatch<T>(&self, def: &TaskDef, call: Call<T>) -> Result<Unfuture<T>>
    where
        T: Clone + Send + 'static,
    {
        let mode = def.mode()?;
        tracing::debug!("Dispatching {} as {:?}", def.id, mode);

        match (mode, call.body) {
            (DispatchMode::Cooperative, Body::Cooperative(task)) => {
                Ok(Unfuture::spawn_cooperative(self.loop_handle(), task))
            }
            (DispatchMode::Thread, Body::Plain(function)) => Ok(self.spawn_thread(function)),
            (DispatchMode::Process, Body::Remote { item, decode }) => {
                self.spawn_process(item?, decode)
            }
            (mode, body) => Err(Error::Configuration(format!(
                "{} selects {:?} dispatch but was called with a {} body",
                def.id,
                mode,
                body.describe()
            ))),
        }
    }

    fn spawn_thread<T>(&self, function: Box<dyn FnOnce() -> Result<T> + Send + 'static>) -> Unfuture<T>
    where
        T: Clone + Send + 'static,
    {
        let (future, completer) = Unfuture::with_completer(self.loop_handle(), Origin::Thread);
        self.thread_pool().spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(function))
                .unwrap_or_else(|payload| Err(TaskError::panicked(payload).into()));
            completer.complete(outcome);
        });
        future
    }

    fn spawn_process<T>(&self, item: WorkItem, decode: fn(&[u8]) -> Result<T>) -> Result<Unfuture<T>>
    where
        T: Clone + Send + 'static,
    {
        let pool = self.process_pool()?;
        let (future, completer) = Unfuture::with_completer(self.loop_handle(), Origin::Process);
        let function = item.function.clone();
        pool.submit(item, move |reply| {
            let outcome = reply.and_then(|bytes| {
                decode(&bytes).map_err(|e| {
                    Error::Propagation(format!("cannot adopt the result of {}: {}", function, e))
                })
            });
            completer.complete(outcome);
        });
        Ok(future)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::RuntimeConfig;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_thread_pool_size(2)).unwrap()
    }

    fn id(name: &str) -> FunctionId {
        FunctionId::new("dispatch_tests", name)
    }

    #[test]
    fn test_mode_table() {
        let on = TaskOptions { cpu_bound: true };
        let off = TaskOptions::default();
        let f = id("f");

        assert_eq!(
            DispatchMode::select(FunctionKind::Cooperative, off, &f).unwrap(),
            DispatchMode::Cooperative
        );
        assert!(matches!(
            DispatchMode::select(FunctionKind::Cooperative, on, &f),
            Err(Error::Configuration(_))
        ));
        assert_eq!(
            DispatchMode::select(FunctionKind::Plain, off, &f).unwrap(),
            DispatchMode::Thread
        );
        assert_eq!(
            DispatchMode::select(FunctionKind::Plain, on, &f).unwrap(),
            DispatchMode::Process
        );
    }

    #[test]
    fn test_thread_dispatch() {
        let runtime = runtime();
        let def = TaskDef::plain(id("add"));
        let future = runtime.dispatch(&def, Call::plain(|| 2 + 3)).unwrap();
        assert_eq!(future.origin(), Origin::Thread);
        assert_eq!(future.wait().unwrap(), 5);
    }

    #[test]
    fn test_thread_dispatch_does_not_block() {
        let runtime = runtime();
        let def = TaskDef::plain(id("slow"));
        let started = Instant::now();
        let future = runtime
            .dispatch(
                &def,
                Call::plain(|| {
                    std::thread::sleep(Duration::from_millis(300));
                    1
                }),
            )
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!future.done());
        assert_eq!(future.wait().unwrap(), 1);
    }

    #[test]
    fn test_thread_panic_becomes_task_error() {
        let runtime = runtime();
        let def = TaskDef::plain(id("explode"));
        let future = runtime
            .dispatch(&def, Call::plain(|| -> u32 { panic!("kaboom") }))
            .unwrap();
        let err = future.wait().unwrap_err();
        assert!(err.as_task().unwrap().is_panic());
        assert_eq!(err.to_string(), "task panicked: kaboom");
    }

    #[test]
    fn test_fallible_plain_error_is_task_error() {
        let runtime = runtime();
        let def = TaskDef::plain(id("parse"));
        let future = runtime
            .dispatch(&def, Call::plain_fallible(|| "x".parse::<u32>()))
            .unwrap();
        let err = future.wait().unwrap_err();
        assert!(
            err.as_task()
                .unwrap()
                .downcast_ref::<std::num::ParseIntError>()
                .is_some()
        );
    }

    #[test]
    fn test_cooperative_cpu_bound_schedules_nothing() {
        let runtime = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let def = TaskDef::cooperative(id("fetch")).cpu_bound(true);

        let err = runtime
            .dispatch(
                &def,
                Call::cooperative(async move {
                    flag.store(true, Ordering::SeqCst);
                    42
                }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(runtime.stats().process_pools_created, 0);
    }

    #[test]
    fn test_mismatched_body_is_configuration_error() {
        let runtime = runtime();
        let def = TaskDef::plain(id("add"));
        let err = runtime
            .dispatch(&def, Call::cooperative(async { 1 }))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_cooperative_dispatch_runs_on_loop() {
        let runtime = runtime();
        let probe = runtime.loop_handle().clone();
        let def = TaskDef::cooperative(id("where"));
        let future = runtime
            .dispatch(
                &def,
                Call::cooperative(async move {
                    tokio::task::yield_now().await;
                    probe.is_current()
                }),
            )
            .unwrap();
        assert_eq!(future.origin(), Origin::Cooperative);
        assert!(future.wait().unwrap());
    }

    struct Halve;

    impl RemoteTask for Halve {
        type Args = (u32,);
        type Output = u32;

        fn id() -> FunctionId {
            id("halve")
        }

        fn invoke((x,): Self::Args) -> Result<u32> {
            Ok(x / 2)
        }
    }

    #[test]
    fn test_remote_call_encodes_work_item() {
        let call: Call<u32> = Call::remote::<Halve>((10,));
        assert_eq!(format!("{:?}", call), "Call { body: \"remote\" }");
        match call.body {
            Body::Remote { item, decode } => {
                let item = item.unwrap();
                assert_eq!(item.function, id("halve"));
                assert_eq!(item.args, b"[10]");
                assert_eq!(decode(b"5").unwrap(), 5);
                assert!(matches!(decode(b"\"five\""), Err(Error::Deserialization(_))));
            }
            _ => panic!("expected a remote body"),
        }
    }

    #[test]
    fn test_remote_call_on_thread_def_is_rejected() {
        let runtime = runtime();
        let err = runtime
            .dispatch(&TaskDef::plain(id("halve")), Call::remote::<Halve>((4,)))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(runtime.stats().process_pools_created, 0);
    }

    #[test]
    fn test_call_debug() {
        let call = Call::plain(|| 1);
        assert_eq!(format!("{:?}", call), "Call { body: \"plain\" }");
    }
}

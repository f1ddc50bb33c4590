//! Tandem: run a function cooperatively, on a thread pool or in a worker process, and
//! get one future back either way.
//!
//! Mark a function with `#[tandem::task]`. Calling it returns an [`Unfuture`]
//! immediately:
//!
//! - an `async fn` runs on the loop thread, a single dedicated thread driving a
//!   cooperative scheduler;
//! - an ordinary function runs on the worker-thread pool;
//! - an ordinary function marked `#[tandem::task(cpu_bound)]` runs in a worker process.
//!
//! An [`Unfuture`] can be awaited from async code or waited on with
//! [`Unfuture::result`] from any thread except the loop thread, and continuations can
//! be chained onto it with [`Unfuture::then`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tandem::prelude::*;
//!
//! #[tandem::task]
//! fn add(a: i64, b: i64) -> i64 {
//!     a + b
//! }
//!
//! #[tandem::task]
//! async fn fetch() -> u32 {
//!     tokio::task::yield_now().await;
//!     42
//! }
//!
//! #[tandem::task(cpu_bound)]
//! fn square(x: u64) -> u64 {
//!     x * x
//! }
//!
//! fn main() -> tandem::Result<()> {
//!     // Worker processes re-run this binary; they must stop here.
//!     tandem::worker::run_if_worker(&Registry::new().with::<square>());
//!
//!     assert_eq!(add(2, 3).wait()?, 5);
//!     assert_eq!(fetch().wait()?, 42);
//!     assert_eq!(square(5).wait()?, 25);
//!
//!     let scaled = add(2, 3).then(|sum| sum.result(None).map(|v| v * 10));
//!     assert_eq!(scaled.wait()?, 50);
//!     Ok(())
//! }
//! ```

pub use tandem_macros::task;

pub use tandem_core::{
    Call, DispatchMode, Error, FunctionId, FunctionKind, InvokeError, Origin, Registry,
    RemoteTask, Result, Runtime, RuntimeConfig, RuntimeStats, TaskDef, TaskError,
    TaskOptions, Unfuture,
};

pub mod worker {
    //! Entry point for worker processes.
    //!
    //! The process pool launches the current executable again with `TANDEM_WORKER=1`
    //! set. Call [`run_if_worker`] at the top of `main`: in a worker it serves work
    //! items until the parent goes away and then exits the process; otherwise it
    //! returns immediately.

    pub use tandem_core::ipc::{WORKER_ENV, is_worker_process, run_if_worker, serve};
}

pub mod prelude {
    //! Common imports.
    //!
    //! ```rust,ignore
    //! use tandem::prelude::*;
    //! ```

    pub use crate::task;
    pub use crate::{Error, Registry, Result, Runtime, Unfuture};
}

#[doc(hidden)]
pub mod __private {
    use crate::{Call, Runtime, TaskDef, Unfuture};

    /// Dispatch on the global runtime. Errors become an already-failed future, so a
    /// decorated function always returns a future.
    pub fn dispatch<T>(def: &TaskDef, call: Call<T>) -> Unfuture<T>
    where
        T: Clone + Send + 'static,
    {
        let runtime = Runtime::global();
        runtime.dispatch(def, call).unwrap_or_else(|err| {
            tracing::debug!("Dispatch of {} failed: {}", def.id(), err);
            Unfuture::failed(runtime, err)
        })
    }
}

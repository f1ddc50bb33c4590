//! Executor pools: the loop thread, the worker-thread pool and the worker-process pool.
//!
//! # Architecture
//!
//! ```text
//! Runtime
//!     │
//!     ├── EventLoop (loop thread, single-threaded tokio scheduler)
//!     │       └── cooperative tasks, continuations, hand-off callbacks
//!     │
//!     ├── rayon::ThreadPool (eager)
//!     │       └── plain tasks
//!     │
//!     └── ProcessPool (lazy, created at most once)
//!             └── dispatcher threads ── WorkerHandle ── worker process
//! ```

mod event_loop;
mod process_pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::{Lazy, OnceCell};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

pub use event_loop::{EventLoop, LoopHandle};
pub use process_pool::{ProcessPool, WorkItem};

/// The process-wide runtime used by `#[tandem::task]` functions.
static GLOBAL: Lazy<Runtime> = Lazy::new(|| {
    let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!("Ignoring invalid runtime environment: {}", e);
        RuntimeConfig::default()
    });
    Runtime::new(config).expect("failed to start the tandem runtime")
});

/// Owns the executor pools. Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    threads: rayon::ThreadPool,
    processes: OnceCell<ProcessPool>,
    process_pools_created: AtomicUsize,
    event_loop: EventLoop,
}

/// Counters describing a runtime's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// Worker threads in the thread pool.
    pub threads: usize,
    /// Times the process pool was created (0 or 1).
    pub process_pools_created: usize,
    /// Worker processes started so far.
    pub workers_spawned: usize,
}

impl Runtime {
    /// Start a runtime: builds the thread pool and the loop thread.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut threads = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("tandem-thread-{}", i));
        if let Some(size) = config.thread_pool_size {
            threads = threads.num_threads(size);
        }
        let threads = threads
            .build()
            .map_err(|e| Error::Configuration(format!("cannot start thread pool: {}", e)))?;
        let event_loop = EventLoop::start(&config.loop_thread_name)?;

        tracing::debug!(
            "Runtime started with {} worker threads",
            threads.current_num_threads()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                threads,
                processes: OnceCell::new(),
                process_pools_created: AtomicUsize::new(0),
                event_loop,
            }),
        })
    }

    /// The process-wide runtime, configured from `TANDEM_*` environment variables on
    /// first use. It is never shut down.
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    /// Configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The worker-thread pool.
    pub fn thread_pool(&self) -> &rayon::ThreadPool {
        &self.inner.threads
    }

    /// The worker-process pool, created by the first caller.
    ///
    /// Concurrent first callers observe a single instance. If creation fails the error
    /// goes to the caller that attempted it and a later call tries again.
    pub fn process_pool(&self) -> Result<&ProcessPool> {
        self.inner.processes.get_or_try_init(|| {
            let pool = ProcessPool::new(&self.inner.config)?;
            self.inner.process_pools_created.fetch_add(1, Ordering::SeqCst);
            Ok(pool)
        })
    }

    /// Handle to the loop thread.
    pub fn loop_handle(&self) -> &LoopHandle {
        self.inner.event_loop.handle()
    }

    /// Whether the calling thread is this runtime's loop thread.
    pub fn is_loop_thread(&self) -> bool {
        self.loop_handle().is_current()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            threads: self.inner.threads.current_num_threads(),
            process_pools_created: self.inner.process_pools_created.load(Ordering::SeqCst),
            workers_spawned: self
                .inner
                .processes
                .get()
                .map_or(0, ProcessPool::workers_spawned),
        }
    }

    /// Stop the loop thread and kill idle worker processes.
    ///
    /// Futures still pending on the loop fail with a propagation error. Tasks already
    /// running on the thread or process pools finish, but their results can no longer
    /// reach the cooperative handle.
    pub fn shutdown(&self) {
        self.inner.event_loop.shutdown();
        if let Some(processes) = self.inner.processes.get() {
            processes.shutdown();
        }
        tracing::debug!("Runtime shut down");
    }
}

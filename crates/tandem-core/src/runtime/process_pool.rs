//! Pool of worker processes for `cpu_bound` tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::ipc::{WorkerHandle, WorkerPool};
use crate::registry::FunctionId;

/// A serializable unit of work for a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Function the worker resolves in its registry.
    pub function: FunctionId,
    /// Encoded argument tuple.
    pub args: Vec<u8>,
}

/// Runs [`WorkItem`]s in worker processes.
///
/// Each in-flight item occupies one dispatcher thread doing blocking IPC with one
/// worker, so the number of dispatcher threads bounds the number of busy workers.
pub struct ProcessPool {
    workers: Arc<Mutex<WorkerPool>>,
    dispatchers: rayon::ThreadPool,
    spawned: Arc<AtomicUsize>,
    size: usize,
}

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::ProcessPool(format!("worker pool lock poisoned: {}", e))
}

impl ProcessPool {
    /// Create the pool. No worker process is started until the first submission.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let program = WorkerHandle::locate(config.worker_program.as_deref())?;
        let size = config.effective_process_pool_size();
        let dispatchers = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("tandem-process-{}", i))
            .build()
            .map_err(|e| Error::ProcessPool(format!("cannot start dispatcher threads: {}", e)))?;

        tracing::debug!(
            "Process pool created: up to {} workers running '{}'",
            size,
            program.display()
        );

        Ok(Self {
            workers: Arc::new(Mutex::new(WorkerPool::new(program, size))),
            dispatchers,
            spawned: Arc::new(AtomicUsize::new(0)),
            size,
        })
    }

    /// Run `item` in a worker and hand the encoded result to `on_done`.
    ///
    /// Returns immediately; `on_done` runs on a dispatcher thread.
    pub fn submit(&self, item: WorkItem, on_done: impl FnOnce(Result<Vec<u8>>) + Send + 'static) {
        let workers = self.workers.clone();
        let spawned = self.spawned.clone();
        self.dispatchers
            .spawn(move || on_done(Self::run(&workers, &spawned, item)));
    }

    fn run(workers: &Mutex<WorkerPool>, spawned: &AtomicUsize, item: WorkItem) -> Result<Vec<u8>> {
        // The guard must be released before the spawn path locks again.
        let idle = Self::acquire(workers)?.take_idle();
        let mut worker = match idle {
            Some(worker) => worker,
            None => {
                let program = Self::acquire(workers)?.program().to_path_buf();
                let worker = WorkerHandle::spawn(&program)?;
                spawned.fetch_add(1, Ordering::SeqCst);
                worker
            }
        };

        let result = worker.call(&item.function, item.args);
        match &result {
            // The conversation completed, so the worker is still usable.
            Ok(_) | Err(Error::Task(_)) | Err(Error::UnknownFunction(_)) => {
                Self::acquire(workers)?.put(worker)
            }
            Err(e) => tracing::warn!(
                "Discarding worker {} after failed call to {}: {}",
                worker.pid(),
                item.function,
                e
            ),
        }
        result
    }

    fn acquire(workers: &Mutex<WorkerPool>) -> Result<MutexGuard<'_, WorkerPool>> {
        workers.lock().map_err(lock_error)
    }

    /// Maximum number of concurrently busy workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of worker processes started so far that answered their first ping.
    pub fn workers_spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Number of idle workers kept for reuse.
    pub fn idle_workers(&self) -> usize {
        Self::acquire(&self.workers)
            .map(|workers| workers.idle_count())
            .unwrap_or(0)
    }

    /// Kill all idle workers.
    pub fn shutdown(&self) {
        if let Ok(mut workers) = Self::acquire(&self.workers) {
            workers.shutdown();
        }
    }
}

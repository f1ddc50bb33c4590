use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::{JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result, panic_message};

/// Closure executed on the loop thread.
type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The loop thread: one dedicated thread driving a single-threaded tokio scheduler.
///
/// All cooperative tasks and continuations run here. Other threads never touch the
/// scheduler directly; they inject callbacks through a [`LoopHandle`].
pub struct EventLoop {
    handle: LoopHandle,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    callbacks: mpsc::UnboundedSender<Callback>,
    thread: ThreadId,
}

impl EventLoop {
    /// Start the loop thread.
    pub fn start(thread_name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (callbacks, queue) = mpsc::unbounded_channel::<Callback>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let join_handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                runtime.block_on(Self::drive(queue, shutdown_rx));
                // Dropping the runtime here drops unfinished tasks on this thread.
            })?;

        let handle = LoopHandle {
            callbacks,
            thread: join_handle.thread().id(),
        };
        tracing::debug!("Loop thread '{}' started", thread_name);

        Ok(Self {
            handle,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Scheduler main task. Runs injected callbacks until shutdown is requested, then
    /// drains whatever is still queued.
    async fn drive(mut queue: mpsc::UnboundedReceiver<Callback>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                callback = queue.recv() => match callback {
                    Some(callback) => run_callback(callback),
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }

        queue.close();
        while let Some(callback) = queue.recv().await {
            run_callback(callback);
        }
    }

    /// Get a handle for injecting work.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Stop the loop thread and wait for it to exit.
    ///
    /// Tasks still suspended on the loop are dropped. Idempotent.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(());
        }
        // The loop thread cannot join itself.
        if self.handle.is_current() {
            return;
        }
        if let Some(join_handle) = self.join_handle.lock().ok().and_then(|mut jh| jh.take())
            && join_handle.join().is_err()
        {
            tracing::warn!("Loop thread panicked during shutdown");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LoopHandle {
    /// Whether the calling thread is the loop thread.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Schedule `callback` to run on the loop thread. Callable from any thread.
    pub fn call_soon_threadsafe(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.callbacks
            .send(Box::new(callback))
            .map_err(|_| Error::LoopClosed)
    }

    /// Spawn a cooperative task on the loop thread. Callable from any thread.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.call_soon_threadsafe(move || {
            tokio::spawn(task);
        })
    }
}

fn run_callback(callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            "Loop callback panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

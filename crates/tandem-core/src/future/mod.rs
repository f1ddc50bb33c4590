//! The bridged future returned by every dispatched task.
//!
//! An [`Unfuture`] has two handles onto one outcome:
//!
//! - the **cooperative handle**, resolved only on the loop thread, which backs
//!   `.await`;
//! - the **blocking handle**, a mutex and condition variable usable from any thread,
//!   which backs [`Unfuture::result`].
//!
//! One of them is the origin (the representation the task was submitted as) and the
//! other is synthesized by a one-time hand-off performed by the task's [`Completer`].
//! Both handles end up holding the same outcome, and each transitions exactly once.

mod continuation;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::FutureExt;

use crate::error::{Error, Result, TaskError};
use crate::runtime::{LoopHandle, Runtime};

/// Which representation of an [`Unfuture`] is primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A task running on the loop thread.
    Cooperative,
    /// A closure running on the thread pool.
    Thread,
    /// A work item running in a worker process.
    Process,
    /// No task; completed through [`Unfuture::set_result`] or created settled.
    Detached,
}

/// Future-like handle to the outcome of a dispatched task.
///
/// Await it from cooperative code, or call [`Unfuture::result`] from any thread other
/// than the loop thread. Clones observe the same outcome.
pub struct Unfuture<T> {
    shared: Arc<Shared<T>>,
    event_loop: LoopHandle,
    origin: Origin,
}

struct Shared<T> {
    cooperative: Mutex<Cooperative<T>>,
    blocking: Mutex<Option<Result<T>>>,
    settled: Condvar,
}

struct Cooperative<T> {
    outcome: Option<Result<T>>,
    wakers: Vec<Waker>,
}

/// Lock ignoring poisoning: no critical section here can panic halfway through an
/// update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> Shared<T> {
    fn new(outcome: Option<Result<T>>) -> Self {
        Self {
            cooperative: Mutex::new(Cooperative {
                outcome: outcome.clone(),
                wakers: Vec::new(),
            }),
            blocking: Mutex::new(outcome),
            settled: Condvar::new(),
        }
    }

    /// Resolve the cooperative handle. Loop thread only, unless the loop is gone.
    fn resolve_cooperative(&self, outcome: Result<T>) -> bool {
        let wakers = {
            let mut cooperative = lock(&self.cooperative);
            if cooperative.outcome.is_some() {
                return false;
            }
            cooperative.outcome = Some(outcome);
            std::mem::take(&mut cooperative.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Resolve the blocking handle and wake blocked waiters.
    fn resolve_blocking(&self, outcome: Result<T>) -> bool {
        let mut blocking = lock(&self.blocking);
        if blocking.is_some() {
            return false;
        }
        *blocking = Some(outcome);
        self.settled.notify_all();
        true
    }

    fn cooperative_outcome(&self) -> Option<Result<T>> {
        lock(&self.cooperative).outcome.clone()
    }
}

impl<T> Clone for Unfuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            event_loop: self.event_loop.clone(),
            origin: self.origin,
        }
    }
}

impl<T: Clone + Send + 'static> Unfuture<T> {
    /// A future with no originating task, completed later by [`Unfuture::set_result`].
    pub fn pending(runtime: &Runtime) -> Self {
        Self::unresolved(runtime.loop_handle(), Origin::Detached)
    }

    /// A future that already holds `value`.
    pub fn from_value(runtime: &Runtime, value: T) -> Self {
        Self::settled(runtime.loop_handle(), Ok(value))
    }

    /// A future that already failed with `err`.
    pub fn failed(runtime: &Runtime, err: Error) -> Self {
        Self::settled(runtime.loop_handle(), Err(err))
    }

    fn settled(event_loop: &LoopHandle, outcome: Result<T>) -> Self {
        Self {
            shared: Arc::new(Shared::new(Some(outcome))),
            event_loop: event_loop.clone(),
            origin: Origin::Detached,
        }
    }

    fn unresolved(event_loop: &LoopHandle, origin: Origin) -> Self {
        Self {
            shared: Arc::new(Shared::new(None)),
            event_loop: event_loop.clone(),
            origin,
        }
    }

    /// A pending future together with the completer its origin resolves it through.
    pub(crate) fn with_completer(event_loop: &LoopHandle, origin: Origin) -> (Self, Completer<T>) {
        let future = Self::unresolved(event_loop, origin);
        let completer = Completer {
            shared: Some(future.shared.clone()),
            event_loop: event_loop.clone(),
        };
        (future, completer)
    }

    /// Run `task` on the loop thread; the result is a cooperative-origin future.
    pub(crate) fn spawn_cooperative<F>(event_loop: &LoopHandle, task: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (future, completer) = Self::with_completer(event_loop, Origin::Cooperative);
        let task = async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(TaskError::panicked(payload).into()));
            completer.complete(outcome);
        };
        // On failure the task, and with it the completer, is dropped, which fails the
        // future.
        let _ = event_loop.spawn(task);
        future
    }

    /// Get the outcome, blocking the calling thread until it is available.
    ///
    /// Returns immediately when the future is already resolved. On the loop thread an
    /// unresolved future fails with [`Error::UnsafeWait`], since blocking there would
    /// starve the scheduler that has to resolve it. `timeout` bounds only this wait;
    /// the task keeps running.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T> {
        if let Some(outcome) = self.shared.cooperative_outcome() {
            return outcome;
        }

        let blocking = lock(&self.shared.blocking);
        if blocking.is_none() && self.event_loop.is_current() {
            return Err(Error::UnsafeWait);
        }

        let settled = match timeout {
            None => self
                .shared
                .settled
                .wait_while(blocking, |outcome| outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner),
            Some(limit) => {
                self.shared
                    .settled
                    .wait_timeout_while(blocking, limit, |outcome| outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        (*settled)
            .clone()
            .unwrap_or(Err(Error::Timeout(timeout.unwrap_or_default())))
    }

    /// Block without a timeout.
    pub fn wait(&self) -> Result<T> {
        self.result(None)
    }

    /// Whether either handle holds the outcome.
    pub fn done(&self) -> bool {
        lock(&self.shared.cooperative).outcome.is_some() || lock(&self.shared.blocking).is_some()
    }

    /// Which representation is primary.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Complete an [`Origin::Detached`] future with `value`.
    ///
    /// The completion is scheduled on the loop thread. If several completions race, the
    /// first one processed by the loop wins and the others are ignored. If the loop is
    /// closed, the error is returned and a still pending future fails with
    /// [`Error::Propagation`].
    pub fn set_result(&self, value: T) -> Result<()> {
        if self.origin != Origin::Detached {
            return Err(Error::Configuration(format!(
                "set_result on a future owned by a {:?} task",
                self.origin
            )));
        }

        let shared = self.shared.clone();
        let scheduled = self.event_loop.call_soon_threadsafe(move || {
            if shared.resolve_cooperative(Ok(value.clone())) {
                shared.resolve_blocking(Ok(value));
            } else {
                tracing::warn!("Ignoring set_result on an already resolved future");
            }
        });

        if let Err(e) = &scheduled {
            let err = Error::Propagation(format!("cannot set the result: {}", e));
            if self.shared.resolve_cooperative(Err(err.clone())) {
                self.shared.resolve_blocking(Err(err));
            }
        }
        scheduled
    }
}

impl<T: Clone + Send + 'static> Future for Unfuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cooperative = lock(&self.shared.cooperative);
        if let Some(outcome) = &cooperative.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !cooperative.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            cooperative.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Unfuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if lock(&self.shared.cooperative).outcome.is_some()
            || lock(&self.shared.blocking).is_some()
        {
            "settled"
        } else {
            "pending"
        };
        f.debug_struct("Unfuture")
            .field("origin", &self.origin)
            .field("state", &state)
            .finish()
    }
}

/// Origin-side handle that resolves an [`Unfuture`] exactly once.
///
/// Dropping it without completing fails the future, so a lost task never leaves a
/// waiter hanging.
pub(crate) struct Completer<T: Clone + Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
    event_loop: LoopHandle,
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub(crate) fn complete(mut self, outcome: Result<T>) {
        if let Some(shared) = self.shared.take() {
            deliver(&self.event_loop, shared, outcome);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            deliver(
                &self.event_loop,
                shared,
                Err(Error::Propagation(
                    "task was dropped before completing".to_string(),
                )),
            );
        }
    }
}

/// Resolve both handles with `outcome`.
///
/// On the loop thread both are resolved in place. Elsewhere the cooperative resolution
/// is injected into the loop first; if that fails, both handles fail with the
/// propagation error instead.
fn deliver<T: Clone + Send + 'static>(event_loop: &LoopHandle, shared: Arc<Shared<T>>, outcome: Result<T>) {
    if event_loop.is_current() {
        shared.resolve_cooperative(outcome.clone());
        shared.resolve_blocking(outcome);
        return;
    }

    let target = shared.clone();
    let forwarded = outcome.clone();
    match event_loop.call_soon_threadsafe(move || {
        target.resolve_cooperative(forwarded);
    }) {
        Ok(()) => {
            shared.resolve_blocking(outcome);
        }
        Err(e) => {
            let err = Error::Propagation(format!(
                "cannot hand the outcome over to the loop thread: {}",
                e
            ));
            shared.resolve_blocking(Err(err.clone()));
            // No loop thread is left to own the cooperative handle.
            shared.resolve_cooperative(Err(err));
        }
    }
}

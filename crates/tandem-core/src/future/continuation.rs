//! Continuations attached to an [`Unfuture`].

use std::future::Future;

use super::Unfuture;
use crate::error::Error;

impl<T: Clone + Send + 'static> Unfuture<T> {
    /// Run `continuation` on the loop thread once this future settles successfully.
    ///
    /// The returned future is cooperative-origin and resolves to the continuation's
    /// value. If this future fails, the continuation never runs and the returned future
    /// fails with the same error. A continuation that returns an error, or panics,
    /// fails the returned future. The continuation receives this future, already
    /// settled, so `source.result(None)` returns without blocking.
    pub fn then<R, E, C>(&self, continuation: C) -> Unfuture<R>
    where
        R: Clone + Send + 'static,
        E: Into<anyhow::Error>,
        C: FnOnce(&Unfuture<T>) -> Result<R, E> + Send + 'static,
    {
        let source = self.clone();
        Unfuture::spawn_cooperative(&self.event_loop, async move {
            source.clone().await?;
            continuation(&source).map_err(Error::from_task)
        })
    }

    /// Like [`Unfuture::then`], but the continuation is asynchronous and its future is
    /// awaited on the loop thread. Returning another [`Unfuture`] adopts its outcome.
    pub fn then_async<R, E, C, Fut>(&self, continuation: C) -> Unfuture<R>
    where
        R: Clone + Send + 'static,
        E: Into<anyhow::Error>,
        C: FnOnce(Unfuture<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let source = self.clone();
        Unfuture::spawn_cooperative(&self.event_loop, async move {
            source.clone().await?;
            continuation(source).await.map_err(Error::from_task)
        })
    }
}

// Continuation rebinding: a future polled with a captured context attached,
// which keeps that context attached for a bounded number of chained
// continuations (`then`/`map`) registered on it.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{self, Poll},
};

use futures::future::{BoxFuture, FutureExt, Map, Then};
use opentelemetry::Context;
use pin_project::pin_project;

#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct BoundFuture<F> {
    #[pin]
    inner: F,
    context: Option<Context>,
    depth: usize,
}

impl<F> BoundFuture<F> {
    /// Polls `inner` under `context`; the next `depth` continuations run under it too.
    pub fn new(inner: F, context: Context, depth: usize) -> Self {
        Self {
            inner,
            context: Some(context),
            depth,
        }
    }

    pub fn unbound(inner: F) -> Self {
        Self {
            inner,
            context: None,
            depth: 0,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn next_level(&self) -> (Option<Context>, usize) {
        match &self.context {
            Some(context) if self.depth > 0 => (Some(context.clone()), self.depth - 1),
            _ => (None, 0),
        }
    }
}

impl<F: Future> BoundFuture<F> {
    pub fn then<Fut, G>(self, f: G) -> BoundFuture<Then<Self, Fut, G>>
    where
        G: FnOnce(F::Output) -> Fut,
        Fut: Future,
    {
        let (context, depth) = self.next_level();
        BoundFuture {
            inner: FutureExt::then(self, f),
            context,
            depth,
        }
    }

    pub fn map<T, G>(self, f: G) -> BoundFuture<Map<Self, G>>
    where
        G: FnOnce(F::Output) -> T,
    {
        let (context, depth) = self.next_level();
        BoundFuture {
            inner: FutureExt::map(self, f),
            context,
            depth,
        }
    }

    /// Type-erases the inner future, keeping the binding.
    pub fn boxed<'a>(self) -> BoundFuture<BoxFuture<'a, F::Output>>
    where
        F: Send + 'a,
    {
        BoundFuture {
            inner: FutureExt::boxed(self.inner),
            context: self.context,
            depth: self.depth,
        }
    }
}

impl<F: Future> Future for BoundFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.context.as_ref().map(|context| context.clone().attach());
        this.inner.poll(cx)
    }
}

impl<F> fmt::Debug for BoundFuture<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFuture")
            .field("bound", &self.context.is_some())
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

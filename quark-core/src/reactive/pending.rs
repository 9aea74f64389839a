//! Pending Resolutions
//!
//! A [`Pending`] is a cloneable handle to one resolution. Every caller that
//! asks for an atom while it resolves gets a clone of the same handle, so the
//! underlying producer runs once and all callers observe the same result.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{self, LocalBoxFuture, Shared};
use futures_util::FutureExt;

use crate::error::Error;

/// Type-erased completion signal of a resolution.
pub(crate) type Settled = Shared<LocalBoxFuture<'static, ()>>;

/// A shared, cloneable future of a resolution.
pub struct Pending<T> {
    inner: Shared<LocalBoxFuture<'static, Result<T, Error>>>,
}

impl<T> Pending<T>
where
    T: Clone + 'static,
{
    /// Wrap a future so that it can be awaited by several callers.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + 'static,
    {
        Self {
            inner: future.boxed_local().shared(),
        }
    }

    /// A resolution that already finished with `result`.
    pub fn ready(result: Result<T, Error>) -> Self {
        Self::new(future::ready(result))
    }

    /// The result, if the resolution has finished.
    pub fn peek(&self) -> Option<&Result<T, Error>> {
        self.inner.peek()
    }

    /// Whether the resolution has finished.
    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }

    /// Whether two handles belong to the same resolution.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    /// A completion signal that ignores the result.
    pub(crate) fn settled(&self) -> Settled {
        self.inner.clone().map(|_| ()).boxed_local().shared()
    }

    /// A future of the outcome without the value.
    pub(crate) fn discard(&self) -> LocalBoxFuture<'static, Result<(), Error>> {
        self.inner.clone().map(|result| result.map(|_| ())).boxed_local()
    }
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Future for Pending<T>
where
    T: Clone,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_is_settled_after_poll() {
        let pending = Pending::ready(Ok(5));
        let value = pending.clone().now_or_never();
        assert!(matches!(value, Some(Ok(5))));
        assert!(matches!(pending.peek(), Some(Ok(5))));
    }

    #[test]
    fn clones_share_one_resolution() {
        let pending = Pending::<u32>::new(async { Ok(1) });
        let clone = pending.clone();
        assert!(pending.ptr_eq(&clone));
        assert!(!pending.ptr_eq(&Pending::ready(Ok(1))));
    }
}

//! Turn a blocking iterator into an async stream.
//!
//! Decoding a rasterized page from disk is slow enough that we don't want to
//! do it on an executor thread, so each call to `next` is moved onto Tokio's
//! blocking pool.

use std::{
    panic,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{FutureExt as _, Stream};

use super::BoxedFuture;
use crate::prelude::*;

/// Where a [`BlockingIterStream`] currently keeps its iterator.
enum State<I, T>
where
    I: Iterator<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    /// The iterator is idle, and we can ask it for the next value.
    Idle(I),

    /// The iterator is out on a blocking thread computing the next value.
    Busy(BoxedFuture<(Option<Result<T>>, I)>),
}

/// A [`Stream`] wrapping a blocking iterator.
pub struct BlockingIterStream<I, T>
where
    I: Iterator<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    /// Always `Some` between calls to `poll_next`.
    state: Option<State<I, T>>,
}

impl<I, T> BlockingIterStream<I, T>
where
    I: Iterator<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    /// Wrap `iter`.
    pub fn new(iter: I) -> Self {
        Self {
            state: Some(State::Idle(iter)),
        }
    }
}

impl<I, T> Stream for BlockingIterStream<I, T>
where
    I: Iterator<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    type Item = I::Item;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let state = self
            .state
            .take()
            .expect("BlockingIterStream state should be restored after every poll");

        let mut future = match state {
            // Lend the iterator to a blocking thread. It comes back with the
            // value.
            State::Idle(mut iter) => spawn_blocking_propagating_panics(move || {
                let next = iter.next();
                (next, iter)
            })
            .boxed(),
            State::Busy(future) => future,
        };

        match future.as_mut().poll(cx) {
            Poll::Ready((next, iter)) => {
                self.state = Some(State::Idle(iter));
                Poll::Ready(next)
            }
            Poll::Pending => {
                self.state = Some(State::Busy(future));
                Poll::Pending
            }
        }
    }
}

/// Run `f` on Tokio's blocking pool, re-raising any panic on the caller's
/// task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

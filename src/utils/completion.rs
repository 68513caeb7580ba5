//! # Completion Handles
//!
//! Single-shot outcome signals for asynchronous operations.
//!
//! Every `connect`, `send` and `disconnect` call returns a [`Completion`]
//! immediately. The operation itself runs on the I/O executor and fulfils the
//! matching [`Resolver`] exactly once.
//!
//! Outcomes:
//! - `Ok(true)`: the operation finished successfully
//! - `Ok(false)`: the operation did not happen (not connected, already closed,
//!   or the pending work was dropped before it started)
//! - `Err(e)`: the operation started and failed part-way
//!
//! A completion can be awaited from async code or waited on from a plain
//! thread with [`Completion::wait`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, WireError};

/// Create a linked resolver / completion pair.
pub fn completion() -> (Resolver, Completion) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Completion { rx })
}

/// Write side of a completion handle.
#[derive(Debug)]
pub struct Resolver {
    tx: oneshot::Sender<Result<bool>>,
}

impl Resolver {
    pub fn resolve(self, value: bool) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: WireError) {
        self.complete(Err(error));
    }

    pub fn complete(self, outcome: Result<bool>) {
        // The caller may have dropped its handle; nothing to report then.
        let _ = self.tx.send(outcome);
    }
}

/// Read side of a completion handle.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited or inspected"]
pub struct Completion {
    rx: oneshot::Receiver<Result<bool>>,
}

impl Completion {
    /// A handle that is already resolved with `value`.
    pub fn ready(value: bool) -> Self {
        let (resolver, completion) = completion();
        resolver.resolve(value);
        completion
    }

    /// A handle that is already resolved with an error.
    pub fn failed(error: WireError) -> Self {
        let (resolver, completion) = completion();
        resolver.fail(error);
        completion
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Works on any thread, including one that is driving a tokio runtime,
    /// except the I/O executor that resolves it; use `.await` there.
    pub fn wait(self) -> Result<bool> {
        futures::executor::block_on(self)
    }

    /// Non-blocking check. `None` while the operation is still pending.
    pub fn try_result(&mut self) -> Option<Result<bool>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Ok(false)),
        }
    }
}

impl Future for Completion {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Resolver dropped without an answer: the work was abandoned.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(false)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_ready_and_failed() {
        assert!(Completion::ready(true).wait().unwrap());
        assert!(!Completion::ready(false).wait().unwrap());
        assert!(matches!(
            Completion::failed(WireError::NotConnected).wait(),
            Err(WireError::NotConnected)
        ));
    }

    #[test]
    fn test_dropped_resolver_reads_as_false() {
        let (resolver, completion) = completion();
        drop(resolver);
        assert!(!completion.wait().unwrap());
    }

    #[test]
    fn test_try_result_pending_then_resolved() {
        let (resolver, mut completion) = completion();
        assert!(completion.try_result().is_none());
        resolver.resolve(true);
        assert!(completion.try_result().unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_await_across_tasks() {
        let (resolver, completion) = completion();
        tokio::spawn(async move {
            resolver.fail(WireError::WriteFailure("broken".into()));
        });
        assert!(matches!(completion.await, Err(WireError::WriteFailure(_))));
    }

    #[tokio::test]
    async fn test_wait_from_runtime_thread() {
        let (resolver, completion) = completion();
        let resolving = std::thread::spawn(move || resolver.resolve(true));
        assert!(completion.wait().unwrap());
        resolving.join().unwrap();
    }
}

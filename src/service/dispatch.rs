//! # Inbox and Dispatch Loop
//!
//! Connection drivers push what they receive into one shared [`Inbox`]. A
//! single dispatch loop drains it and hands every [`Delivery`] to the user's
//! handler, on one thread, in arrival order.
//!
//! The loop sleeps on the channel and wakes on each push or on stop, so an
//! idle interface costs no CPU. At most one loop drains an inbox at a time:
//! starting a second one fails with
//! [`WireError::ConcurrentDispatchLoop`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::message::{ConnectionId, Message};
use crate::error::{constants, Result, WireError};
use crate::utils::ts_queue::lock_unpoisoned;

/// One item drained by the dispatch loop
#[derive(Debug)]
pub enum Delivery<T> {
    /// A complete frame; `origin()` names its connection
    Message(Message<T>),
    /// A connection finished its handshake and is reading
    Connected(ConnectionId),
    /// A connection closed, or failed to establish
    Disconnected(ConnectionId),
}

/// Whether `run` blocks the caller or spawns a dispatch thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    #[default]
    Blocking,
    NonBlocking,
}

/// Producer side handed to connection drivers
#[derive(Debug)]
pub(crate) struct InboxSender<T> {
    tx: mpsc::UnboundedSender<Delivery<T>>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for InboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> InboxSender<T> {
    pub(crate) fn push(&self, message: Message<T>) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Delivery::Message(message)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn connected(&self, id: ConnectionId) {
        let _ = self.tx.send(Delivery::Connected(id));
    }

    pub(crate) fn disconnected(&self, id: ConnectionId) {
        let _ = self.tx.send(Delivery::Disconnected(id));
    }
}

/// Shared incoming queue of one interface
#[derive(Debug)]
pub struct Inbox<T> {
    sender: InboxSender<T>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery<T>>>>,
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: InboxSender {
                tx,
                pending: Arc::new(AtomicUsize::new(0)),
            },
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> InboxSender<T> {
        self.sender.clone()
    }

    /// Messages received but not yet dispatched
    pub fn len(&self) -> usize {
        self.sender.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything queued. A no-op while a dispatch loop owns the
    /// receiver; returns the number of deliveries dropped.
    pub fn clear(&self) -> usize {
        let mut slot = lock_unpoisoned(&self.receiver);
        let Some(rx) = slot.as_mut() else {
            return 0;
        };

        let mut dropped = 0;
        while let Ok(delivery) = rx.try_recv() {
            if matches!(delivery, Delivery::Message(_)) {
                self.sender.pending.fetch_sub(1, Ordering::Relaxed);
            }
            dropped += 1;
        }
        dropped
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Delivery<T>>> {
        lock_unpoisoned(&self.receiver).take()
    }

    fn restore_receiver(&self, rx: mpsc::UnboundedReceiver<Delivery<T>>) {
        *lock_unpoisoned(&self.receiver) = Some(rx);
    }

    fn mark_dispatched(&self, delivery: &Delivery<T>) {
        if matches!(delivery, Delivery::Message(_)) {
            self.sender.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Drains one [`Inbox`] into a handler closure
#[derive(Debug)]
pub(crate) struct DispatchLoop<T> {
    inbox: Arc<Inbox<T>>,
    active: AtomicBool,
    stop: Mutex<CancellationToken>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Thread running a blocking loop, signalled through `idle` when it returns
    runner: Mutex<Option<ThreadId>>,
    idle: Condvar,
    name: String,
}

impl<T: Send + 'static> DispatchLoop<T> {
    pub(crate) fn new(inbox: Arc<Inbox<T>>, name: impl Into<String>) -> Self {
        Self {
            inbox,
            active: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            thread: Mutex::new(None),
            runner: Mutex::new(None),
            idle: Condvar::new(),
            name: name.into(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Drain deliveries until `handler` breaks or [`stop`](Self::stop) is
    /// called.
    pub(crate) fn run<F>(self: &Arc<Self>, policy: RunPolicy, handler: F) -> Result<()>
    where
        F: FnMut(Delivery<T>) -> ControlFlow<()> + Send + 'static,
    {
        // Held through setup so a concurrent stop() cancels this loop's token.
        let mut stop_slot = lock_unpoisoned(&self.stop);
        if self.active.swap(true, Ordering::AcqRel) {
            error!(loop_name = %self.name, "{}", constants::ERR_DISPATCH_RUNNING);
            return Err(WireError::ConcurrentDispatchLoop);
        }

        let Some(receiver) = self.inbox.take_receiver() else {
            self.active.store(false, Ordering::Release);
            error!(loop_name = %self.name, "{}", constants::ERR_DISPATCH_RUNNING);
            return Err(WireError::ConcurrentDispatchLoop);
        };

        let stop = CancellationToken::new();
        *stop_slot = stop.clone();

        match policy {
            RunPolicy::Blocking => {
                *lock_unpoisoned(&self.runner) = Some(thread::current().id());
                drop(stop_slot);
                self.drain(receiver, stop, handler);
                Ok(())
            }
            RunPolicy::NonBlocking => {
                let mut slot = lock_unpoisoned(&self.thread);
                if let Some(finished) = slot.take() {
                    let _ = finished.join();
                }

                let this = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || this.drain(receiver, stop, handler));

                match spawned {
                    Ok(handle) => {
                        *slot = Some(handle);
                        drop(stop_slot);
                        Ok(())
                    }
                    Err(e) => {
                        // The closure and its receiver are gone with the failed spawn.
                        self.active.store(false, Ordering::Release);
                        error!(loop_name = %self.name, error = %e, "Failed to spawn dispatch thread");
                        Err(WireError::Io(e))
                    }
                }
            }
        }
    }

    fn drain<F>(
        &self,
        mut receiver: mpsc::UnboundedReceiver<Delivery<T>>,
        stop: CancellationToken,
        mut handler: F,
    ) where
        F: FnMut(Delivery<T>) -> ControlFlow<()>,
    {
        debug!(loop_name = %self.name, "Dispatch loop started");

        loop {
            let next = futures::executor::block_on(async {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    delivery = receiver.recv() => delivery,
                }
            });

            let Some(delivery) = next else { break };
            self.inbox.mark_dispatched(&delivery);
            if handler(delivery).is_break() {
                break;
            }
        }

        self.inbox.restore_receiver(receiver);
        self.active.store(false, Ordering::Release);
        *lock_unpoisoned(&self.runner) = None;
        self.idle.notify_all();
        debug!(loop_name = %self.name, "Dispatch loop stopped");
    }

    /// Wake the loop and wait for it to return.
    ///
    /// Joins a non-blocking loop thread. A blocking loop running on another
    /// thread is waited for until it has handed the receiver back. Called
    /// from inside the handler, this only signals.
    pub(crate) fn stop(&self) {
        lock_unpoisoned(&self.stop).cancel();

        let handle = lock_unpoisoned(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let me = thread::current().id();
        let mut runner = lock_unpoisoned(&self.runner);
        while runner.is_some_and(|id| id != me) {
            runner = self
                .idle
                .wait(runner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

//! Dedicated I/O executor.
//!
//! One single-threaded tokio runtime per interface, driven by one named OS
//! thread. Every socket operation and every connection driver of that
//! interface runs there, so per-connection state is only ever touched from
//! one thread.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::utils::ts_queue::lock_unpoisoned;

/// A runtime plus the thread that drives it
#[derive(Debug)]
pub struct Executor {
    handle: Handle,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(name: &str) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let token = stop.clone();
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                runtime.block_on(token.cancelled());
                // Dropping the runtime cancels every remaining task and
                // closes the sockets they own.
                drop(runtime);
                debug!(thread = %thread_name, "I/O executor stopped");
            })?;

        debug!(thread = %name, "I/O executor started");
        Ok(Self {
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Stop the runtime and join its thread. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
        let handle = lock_unpoisoned(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

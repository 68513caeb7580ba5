//! # Client Interface
//!
//! Owns one outgoing [`Connection`], its I/O executor and a dispatch loop.
//!
//! Incoming messages are handed to a [`ClientHandler`] on the dispatch
//! thread. Plain closures work as handlers:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framewire::{ClientInterface, Connection, Message, RunPolicy, SendStrategy};
//!
//! let client = ClientInterface::<u32, _>::new(
//!     |msg: Message<u32>, _origin: Option<Arc<Connection<u32>>>| println!("got {msg}"),
//! )
//! .unwrap();
//!
//! if client.connect("127.0.0.1", 60000).wait().unwrap() {
//!     client.run(RunPolicy::NonBlocking).unwrap();
//!     client.send(Message::new(1).with(&42u64), SendStrategy::Normal).wait().unwrap();
//! }
//! ```

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument};

use crate::config::NetworkConfig;
use crate::core::message::{ConnectionId, Message, MessageId};
use crate::error::{Result, WireError};
use crate::service::dispatch::{Delivery, DispatchLoop, Inbox, RunPolicy};
use crate::service::executor::Executor;
use crate::transport::connection::{Connection, LinkContext, SendStrategy};
use crate::transport::tls::{TlsContext, TlsOptions};
use crate::utils::completion::Completion;
use crate::utils::metrics::Metrics;
use crate::utils::ts_queue::lock_unpoisoned;

/// User hooks of a client, called on the dispatch thread
pub trait ClientHandler<T: MessageId>: Send + 'static {
    fn on_message(&mut self, message: Message<T>, origin: Option<Arc<Connection<T>>>);

    fn on_connect(&mut self, _connection: Arc<Connection<T>>) {}

    /// The connection closed, or a connect attempt failed.
    fn on_disconnect(&mut self, _id: ConnectionId) {}
}

impl<T, F> ClientHandler<T> for F
where
    T: MessageId,
    F: FnMut(Message<T>, Option<Arc<Connection<T>>>) + Send + 'static,
{
    fn on_message(&mut self, message: Message<T>, origin: Option<Arc<Connection<T>>>) {
        self(message, origin)
    }
}

type ConnectionSlot<T> = Arc<Mutex<Option<Arc<Connection<T>>>>>;

/// Single-connection client façade
pub struct ClientInterface<T: MessageId, H: ClientHandler<T>> {
    executor: Executor,
    connection: ConnectionSlot<T>,
    inbox: Arc<Inbox<T>>,
    dispatch: Arc<DispatchLoop<T>>,
    handler: Arc<Mutex<H>>,
    tls: Option<Arc<TlsContext>>,
    config: NetworkConfig,
    metrics: Arc<Metrics>,
}

impl<T: MessageId, H: ClientHandler<T>> ClientInterface<T, H> {
    /// Client with default configuration and no TLS.
    pub fn new(handler: H) -> Result<Self> {
        Self::with_config(handler, &NetworkConfig::default())
    }

    /// Client configured from `config`, with TLS when `transport.tls` is set.
    pub fn with_config(handler: H, config: &NetworkConfig) -> Result<Self> {
        let tls = match &config.transport.tls {
            Some(options) => Some(Arc::new(TlsContext::for_client(options)?)),
            None => None,
        };
        let inbox = Arc::new(Inbox::new());

        Ok(Self {
            executor: Executor::new("framewire-client-io")?,
            connection: Arc::new(Mutex::new(None)),
            dispatch: Arc::new(DispatchLoop::new(
                Arc::clone(&inbox),
                "framewire-client-dispatch",
            )),
            inbox,
            handler: Arc::new(Mutex::new(handler)),
            tls,
            config: config.clone(),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Secure future connections with TLS.
    pub fn set_tls_options(&mut self, options: &TlsOptions) -> Result<()> {
        self.tls = Some(Arc::new(TlsContext::for_client(options)?));
        self.config.transport.tls = Some(options.clone());
        Ok(())
    }

    fn link_context(&self) -> LinkContext<T> {
        LinkContext {
            runtime: self.executor.handle().clone(),
            inbox: self.inbox.sender(),
            tls: self.tls.clone(),
            metrics: Arc::clone(&self.metrics),
            max_payload: self.config.transport.max_payload_size,
            establish_timeout: self.config.client.connect_timeout,
        }
    }

    /// Current connection object, connected or not
    pub fn connection(&self) -> Option<Arc<Connection<T>>> {
        lock_unpoisoned(&self.connection).clone()
    }

    /// True while the current connection carries traffic
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    /// Connect to `host:port`, replacing any existing connection.
    ///
    /// An existing connection is disconnected first.
    #[instrument(skip(self))]
    pub fn connect(&self, host: &str, port: u16) -> Completion {
        let connection = Arc::new(Connection::new(self.link_context()));
        let previous = lock_unpoisoned(&self.connection).replace(Arc::clone(&connection));

        if let Some(previous) = previous {
            debug!(conn = %previous.id(), "Replacing existing connection");
            drop(previous.disconnect());
        }

        info!(conn = %connection.id(), tls = connection.is_tls(), "Connecting");
        connection.connect(host, port)
    }

    /// Close the current connection. Resolves `Ok(false)` if there is none.
    pub fn disconnect(&self) -> Completion {
        match self.connection() {
            Some(connection) => connection.disconnect(),
            None => Completion::ready(false),
        }
    }

    /// Send to the server. Resolves `Ok(false)` when not connected.
    pub fn send(&self, message: Message<T>, strategy: SendStrategy) -> Completion {
        match self.connection() {
            Some(connection) => connection.send(message, strategy),
            None => Completion::ready(false),
        }
    }

    /// Dispatch incoming messages until the connection closes or
    /// [`stop`](Self::stop) is called.
    ///
    /// Fails with `NotConnected` if `connect` was never called and with
    /// `ConcurrentDispatchLoop` if a loop is already running.
    pub fn run(&self, policy: RunPolicy) -> Result<()> {
        if self.connection().is_none() {
            return Err(WireError::NotConnected);
        }

        let slot = Arc::clone(&self.connection);
        let handler = Arc::clone(&self.handler);

        self.dispatch.run(policy, move |delivery| {
            let resolve = |id: ConnectionId| {
                lock_unpoisoned(&slot)
                    .as_ref()
                    .filter(|c| c.id() == id)
                    .cloned()
            };

            match delivery {
                Delivery::Message(message) => {
                    let origin = message.origin().and_then(resolve);
                    lock_unpoisoned(&handler).on_message(message, origin);
                    ControlFlow::Continue(())
                }
                Delivery::Connected(id) => {
                    if let Some(connection) = resolve(id) {
                        lock_unpoisoned(&handler).on_connect(connection);
                    }
                    ControlFlow::Continue(())
                }
                Delivery::Disconnected(id) => {
                    lock_unpoisoned(&handler).on_disconnect(id);
                    let current = lock_unpoisoned(&slot).as_ref().map(|c| c.id());
                    if current == Some(id) {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            }
        })
    }

    /// Stop the dispatch loop; the connection stays open.
    pub fn stop(&self) {
        self.dispatch.stop();
    }

    /// True while a dispatch loop is draining the inbox
    pub fn is_running(&self) -> bool {
        self.dispatch.is_running()
    }

    /// Messages received but not yet dispatched
    pub fn incoming_count(&self) -> usize {
        self.inbox.len()
    }

    /// Lock and borrow the handler, e.g. to read state it collected.
    pub fn handler(&self) -> MutexGuard<'_, H> {
        lock_unpoisoned(&self.handler)
    }

    /// Traffic counters for this client
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<T: MessageId, H: ClientHandler<T>> Drop for ClientInterface<T, H> {
    fn drop(&mut self) {
        if let Some(connection) = lock_unpoisoned(&self.connection).take() {
            drop(connection.disconnect());
        }
        self.executor.stop();
        self.dispatch.stop();
    }
}

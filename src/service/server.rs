//! # Server Interface
//!
//! Accepts connections, keeps a registry of live ones and dispatches their
//! messages to a [`ServerHandler`].
//!
//! The handler receives a [`ServerHandle`] with every callback, so it can
//! reply, broadcast or kick from inside `on_message` without holding a
//! reference back to the server itself.
//!
//! ## Lifecycle
//! - `start(port)` binds, listens and begins accepting on the I/O executor
//! - `run(policy)` dispatches deliveries until `stop()` or `shutdown()`
//! - `shutdown()` closes every connection, stops the loop and the executor
//!
//! A connection enters the registry once its handshake succeeds and leaves
//! it when it is kicked or when its disconnect is dispatched.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::message::{ConnectionId, Message, MessageId};
use crate::error::{constants, Result, WireError};
use crate::service::dispatch::{Delivery, DispatchLoop, Inbox, RunPolicy};
use crate::service::executor::Executor;
use crate::transport::connection::{Connection, ConnectionState, LinkContext, SendStrategy};
use crate::transport::tls::{TlsContext, TlsOptions};
use crate::utils::completion::Completion;
use crate::utils::metrics::Metrics;
use crate::utils::ts_queue::{lock_unpoisoned, ThreadSafeQueue};

/// User hooks of a server, called on the dispatch thread
pub trait ServerHandler<T: MessageId>: Send + 'static {
    fn on_message(
        &mut self,
        server: &ServerHandle<T>,
        message: Message<T>,
        origin: Option<Arc<Connection<T>>>,
    );

    fn on_client_connect(&mut self, _server: &ServerHandle<T>, _connection: Arc<Connection<T>>) {}

    fn on_client_disconnect(&mut self, _server: &ServerHandle<T>, _id: ConnectionId) {}
}

impl<T, F> ServerHandler<T> for F
where
    T: MessageId,
    F: FnMut(&ServerHandle<T>, Message<T>, Option<Arc<Connection<T>>>) + Send + 'static,
{
    fn on_message(
        &mut self,
        server: &ServerHandle<T>,
        message: Message<T>,
        origin: Option<Arc<Connection<T>>>,
    ) {
        self(server, message, origin)
    }
}

/// Live connections of a server, in accept order
#[derive(Debug)]
pub struct ConnectionRegistry<T: MessageId> {
    connections: ThreadSafeQueue<Arc<Connection<T>>>,
}

impl<T: MessageId> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            connections: ThreadSafeQueue::new(),
        }
    }
}

impl<T: MessageId> ConnectionRegistry<T> {
    pub fn insert(&self, connection: Arc<Connection<T>>) {
        self.connections.push_back(connection);
    }

    /// Remove by id, returning the entry if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.connections.remove_first(|c| c.id() == id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.connections
            .find_map(|c| (c.id() == id).then(|| Arc::clone(c)))
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection<T>>> {
        self.connections.snapshot()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Empty the registry, handing back what it held.
    pub fn clear(&self) -> Vec<Arc<Connection<T>>> {
        self.connections.drain_all()
    }

    /// Drop entries whose link has fully closed. Returns how many went.
    pub fn prune_closed(&self) -> usize {
        let mut pruned = 0;
        self.connections.retain(|c| {
            let open = c.state() != ConnectionState::Disconnected;
            if !open {
                pruned += 1;
            }
            open
        });
        pruned
    }
}

struct ServerShared<T: MessageId> {
    registry: ConnectionRegistry<T>,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_stop: Mutex<CancellationToken>,
    metrics: Arc<Metrics>,
}

/// Cloneable access to a running server's connections
pub struct ServerHandle<T: MessageId> {
    shared: Arc<ServerShared<T>>,
}

impl<T: MessageId> Clone for ServerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MessageId> ServerHandle<T> {
    /// Send to one client. `Ok(false)` if it is not connected.
    pub fn send(
        &self,
        connection: &Connection<T>,
        message: Message<T>,
        strategy: SendStrategy,
    ) -> Completion {
        connection.send(message, strategy)
    }

    /// Send to a registered client by id. `Ok(false)` if unknown.
    pub fn send_to(&self, id: ConnectionId, message: Message<T>, strategy: SendStrategy) -> Completion {
        match self.shared.registry.get(id) {
            Some(connection) => connection.send(message, strategy),
            None => Completion::ready(false),
        }
    }

    /// Send a copy of `message` to every registered client except `ignore`.
    ///
    /// Returns one completion per attempted send. Clients that are already
    /// dead resolve `Ok(false)` and do not stop the rest.
    pub fn send_all(
        &self,
        ignore: Option<ConnectionId>,
        message: &Message<T>,
        strategy: SendStrategy,
    ) -> Vec<(ConnectionId, Completion)> {
        let targets = self.shared.registry.snapshot();
        debug!(targets = targets.len(), "Broadcasting");

        targets
            .into_iter()
            .filter(|c| Some(c.id()) != ignore)
            .map(|c| (c.id(), c.send(message.clone(), strategy)))
            .collect()
    }

    /// Disconnect a client and drop it from the registry.
    pub fn kick(&self, connection: &Connection<T>) -> Completion {
        info!(conn = %connection.id(), "Kicking client");
        self.shared.registry.remove(connection.id());
        connection.disconnect()
    }

    /// Snapshot of the registered clients
    pub fn connections(&self) -> Vec<Arc<Connection<T>>> {
        self.shared.registry.snapshot()
    }

    /// Look up a registered client by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.shared.registry.get(id)
    }

    /// Number of registered clients
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// True between `start` and `shutdown`
    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::Acquire)
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock_unpoisoned(&self.shared.local_addr)
    }

    /// Counters shared by every client connection
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }
}

/// Multi-client server façade
pub struct ServerInterface<T: MessageId, H: ServerHandler<T>> {
    handle: ServerHandle<T>,
    executor: Mutex<Option<Executor>>,
    inbox: Arc<Inbox<T>>,
    dispatch: Arc<DispatchLoop<T>>,
    handler: Arc<Mutex<H>>,
    tls: Option<Arc<TlsContext>>,
    config: NetworkConfig,
}

impl<T: MessageId, H: ServerHandler<T>> ServerInterface<T, H> {
    /// Plain TCP server with default configuration.
    pub fn new(handler: H) -> Self {
        Self::build(handler, NetworkConfig::default(), None)
    }

    /// Server configured from `config`, with TLS when `transport.tls` is set.
    pub fn with_config(handler: H, config: &NetworkConfig) -> Result<Self> {
        let tls = match &config.transport.tls {
            Some(options) => Some(Arc::new(TlsContext::for_server(options)?)),
            None => None,
        };
        Ok(Self::build(handler, config.clone(), tls))
    }

    fn build(handler: H, config: NetworkConfig, tls: Option<Arc<TlsContext>>) -> Self {
        let inbox = Arc::new(Inbox::new());
        Self {
            handle: ServerHandle {
                shared: Arc::new(ServerShared {
                    registry: ConnectionRegistry::default(),
                    listening: AtomicBool::new(false),
                    local_addr: Mutex::new(None),
                    accept_stop: Mutex::new(CancellationToken::new()),
                    metrics: Arc::new(Metrics::new()),
                }),
            },
            executor: Mutex::new(None),
            dispatch: Arc::new(DispatchLoop::new(
                Arc::clone(&inbox),
                "framewire-server-dispatch",
            )),
            inbox,
            handler: Arc::new(Mutex::new(handler)),
            tls,
            config,
        }
    }

    /// Secure connections accepted after the next `start`.
    pub fn set_tls_options(&mut self, options: &TlsOptions) -> Result<()> {
        self.tls = Some(Arc::new(TlsContext::for_server(options)?));
        self.config.transport.tls = Some(options.clone());
        Ok(())
    }

    /// Cloneable handle for use from other threads
    pub fn handle(&self) -> ServerHandle<T> {
        self.handle.clone()
    }

    /// Start on the port from the configuration.
    pub fn start_configured(&self) -> Result<()> {
        self.start(self.config.server.port)
    }

    /// Bind, listen and begin accepting on `port` (0 picks a free port).
    #[instrument(skip(self))]
    pub fn start(&self, port: u16) -> Result<()> {
        if self.handle.is_listening() {
            warn!("{}", constants::ERR_ALREADY_LISTENING);
            return Err(WireError::AlreadyListening);
        }

        let bind = format!("{}:{}", self.config.server.bind_address, port);
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| WireError::ConfigError(format!("Invalid bind address {bind}: {e}")))?;

        let mut executor = lock_unpoisoned(&self.executor);
        if executor.as_ref().map_or(true, |e| !e.is_running()) {
            *executor = Some(Executor::new("framewire-server-io")?);
        }
        let runtime = executor
            .as_ref()
            .map(|e| e.handle().clone())
            .ok_or(WireError::NotRunning)?;
        drop(executor);

        let listener = {
            let _guard = runtime.enter();
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(self.config.server.backlog)?
        };
        let local = listener.local_addr()?;

        let stop = CancellationToken::new();
        *lock_unpoisoned(&self.handle.shared.accept_stop) = stop.clone();
        *lock_unpoisoned(&self.handle.shared.local_addr) = Some(local);
        self.handle.shared.listening.store(true, Ordering::Release);

        let ctx = LinkContext {
            runtime: runtime.clone(),
            inbox: self.inbox.sender(),
            tls: self.tls.clone(),
            metrics: Arc::clone(&self.handle.shared.metrics),
            max_payload: self.config.transport.max_payload_size,
            establish_timeout: self.config.server.handshake_timeout,
        };
        runtime.spawn(accept_loop(listener, stop, ctx, self.handle.clone()));

        info!(address = %local, tls = self.tls.is_some(), "Server listening");
        Ok(())
    }

    /// Dispatch deliveries until [`stop`](Self::stop) or
    /// [`shutdown`](Self::shutdown).
    pub fn run(&self, policy: RunPolicy) -> Result<()> {
        let server = self.handle.clone();
        let handler = Arc::clone(&self.handler);

        self.dispatch.run(policy, move |delivery| {
            match delivery {
                Delivery::Message(message) => {
                    let origin = message.origin().and_then(|id| server.connection(id));
                    lock_unpoisoned(&handler).on_message(&server, message, origin);
                }
                Delivery::Connected(id) => {
                    if let Some(connection) = server.connection(id) {
                        lock_unpoisoned(&handler).on_client_connect(&server, connection);
                    }
                }
                Delivery::Disconnected(id) => {
                    server.shared.registry.remove(id);
                    lock_unpoisoned(&handler).on_client_disconnect(&server, id);
                }
            }
            ControlFlow::Continue(())
        })
    }

    /// Stop the dispatch loop; connections stay open.
    pub fn stop(&self) {
        self.dispatch.stop();
    }

    /// True while a dispatch loop is draining the inbox
    pub fn is_running(&self) -> bool {
        self.dispatch.is_running()
    }

    /// Close every connection, stop dispatching and accepting, and join the
    /// I/O thread.
    pub fn shutdown(&self) {
        info!(clients = self.handle.connection_count(), "Shutting down server");

        let executor = lock_unpoisoned(&self.executor).take();
        if executor.is_some() {
            for connection in self.handle.shared.registry.snapshot() {
                if let Err(e) = connection.disconnect().wait() {
                    warn!(conn = %connection.id(), error = %e, "Error while closing client");
                }
            }
        }

        self.dispatch.stop();
        lock_unpoisoned(&self.handle.shared.accept_stop).cancel();
        self.handle.shared.listening.store(false, Ordering::Release);
        *lock_unpoisoned(&self.handle.shared.local_addr) = None;
        self.handle.shared.registry.clear();
        self.inbox.clear();

        if let Some(executor) = executor {
            executor.stop();
        }
        self.handle.metrics().log_metrics();
        info!("Server stopped");
    }

    /// See [`ServerHandle::send`].
    pub fn send(&self, connection: &Connection<T>, message: Message<T>, strategy: SendStrategy) -> Completion {
        self.handle.send(connection, message, strategy)
    }

    /// See [`ServerHandle::send_to`].
    pub fn send_to(&self, id: ConnectionId, message: Message<T>, strategy: SendStrategy) -> Completion {
        self.handle.send_to(id, message, strategy)
    }

    /// See [`ServerHandle::send_all`].
    pub fn send_all(
        &self,
        ignore: Option<ConnectionId>,
        message: &Message<T>,
        strategy: SendStrategy,
    ) -> Vec<(ConnectionId, Completion)> {
        self.handle.send_all(ignore, message, strategy)
    }

    /// See [`ServerHandle::kick`].
    pub fn kick(&self, connection: &Connection<T>) -> Completion {
        self.handle.kick(connection)
    }

    /// Snapshot of the registered clients
    pub fn connections(&self) -> Vec<Arc<Connection<T>>> {
        self.handle.connections()
    }

    /// Number of registered clients
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// True between `start` and `shutdown`
    pub fn is_listening(&self) -> bool {
        self.handle.is_listening()
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    /// Messages received but not yet dispatched
    pub fn incoming_count(&self) -> usize {
        self.inbox.len()
    }

    /// Lock and borrow the handler, e.g. to read state it collected.
    pub fn handler(&self) -> MutexGuard<'_, H> {
        lock_unpoisoned(&self.handler)
    }

    /// Counters shared by every client connection
    pub fn metrics(&self) -> &Metrics {
        self.handle.metrics()
    }
}

impl<T: MessageId, H: ServerHandler<T>> Drop for ServerInterface<T, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop<T: MessageId>(
    listener: TcpListener,
    stop: CancellationToken,
    ctx: LinkContext<T>,
    server: ServerHandle<T>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        debug!(%peer, "Inbound connection");
        let ctx = ctx.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let connection = Arc::new(Connection::new(ctx.clone()));
            match connection.accept(stream, peer).await {
                Ok(wire) => {
                    let pruned = server.shared.registry.prune_closed();
                    if pruned > 0 {
                        debug!(pruned, "Pruned closed clients");
                    }
                    // Connected before it is visible, so pruning never sees
                    // it half set up.
                    if connection.start_listening(wire) {
                        server.shared.registry.insert(Arc::clone(&connection));
                        info!(conn = %connection.id(), %peer, "Client connected");
                        ctx.inbox.connected(connection.id());
                    }
                }
                Err(e) => {
                    server.shared.metrics.connection_error();
                    warn!(%peer, error = %e, "Rejected inbound connection");
                }
            }
        });
    }

    debug!("Accept loop stopped");
}

//! # Connection
//!
//! One framed, optionally TLS-secured TCP link.
//!
//! A [`Connection`] is a thread-safe handle. The socket itself is owned by a
//! driver task on the interface's I/O executor, which runs three pipelines
//! from one `select!` loop:
//!
//! - **read**: header, then body, then push to the shared inbox, repeat
//! - **write**: pop the next outgoing item, write header and body, resolve
//!   its completion, repeat until the outgoing queue is empty
//! - **commands**: sends and disconnect requests from any thread
//!
//! Because only the driver touches the socket, reads, writes and teardown
//! never race each other. Commands reach the driver in the order they were
//! issued, so two sends from one thread are written in that order.
//!
//! ## States
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Connected -> Disconnecting -> Disconnected
//! ```
//! Plain TCP skips `Handshaking`. A connection object is single-use: once it
//! left `Disconnected` it never connects again.
//!
//! ## Send strategies
//! `Immediate` puts the item at the front of the outgoing queue. It never
//! interrupts a write already on the wire. `Compressed` and `Encrypted` are
//! accepted and written like `Normal`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::FrameCodec;
use crate::core::message::{ConnectionId, Message, MessageHeader, MessageId};
use crate::error::{constants, is_disconnect_error, Result, WireError};
use crate::service::dispatch::InboxSender;
use crate::transport::stream::WireStream;
use crate::transport::tls::TlsContext;
use crate::utils::completion::{completion, Completion, Resolver};
use crate::utils::metrics::Metrics;
use crate::utils::time::current_timestamp_millis;
use crate::utils::ts_queue::{lock_unpoisoned, ThreadSafeQueue};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Connected = 3,
    Disconnecting = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Handshaking,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Where an outgoing message goes in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendStrategy {
    #[default]
    Normal,
    /// Jump the queue, behind the write already in flight
    Immediate,
    /// Reserved; written as `Normal`
    Compressed,
    /// Reserved; written as `Normal`
    Encrypted,
}

/// Everything a connection borrows from the interface that owns it
pub(crate) struct LinkContext<T> {
    pub(crate) runtime: Handle,
    pub(crate) inbox: InboxSender<T>,
    pub(crate) tls: Option<Arc<TlsContext>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) max_payload: usize,
    /// Bound on TCP connect plus TLS handshake
    pub(crate) establish_timeout: Duration,
}

impl<T> Clone for LinkContext<T> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inbox: self.inbox.clone(),
            tls: self.tls.clone(),
            metrics: Arc::clone(&self.metrics),
            max_payload: self.max_payload,
            establish_timeout: self.establish_timeout,
        }
    }
}

struct OutgoingItem<T> {
    message: Message<T>,
    resolver: Resolver,
}

enum Command<T> {
    Send(OutgoingItem<T>, SendStrategy),
    Disconnect(Resolver),
}

/// State shared between the handle and its driver task
struct Shared<T> {
    state: AtomicU8,
    outgoing: ThreadSafeQueue<OutgoingItem<T>>,
    peer: Mutex<Option<SocketAddr>>,
}

impl<T> Shared<T> {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_peer(&self, peer: Option<SocketAddr>) {
        *lock_unpoisoned(&self.peer) = peer;
    }
}

enum Target {
    Host { host: String, port: u16 },
    Endpoints { addrs: Vec<SocketAddr>, server_name: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host { host, port } => write!(f, "{host}:{port}"),
            Target::Endpoints { addrs, .. } => write!(f, "{addrs:?}"),
        }
    }
}

/// Handle to one framed link
pub struct Connection<T: MessageId> {
    id: ConnectionId,
    shared: Arc<Shared<T>>,
    commands: mpsc::UnboundedSender<Command<T>>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command<T>>>>,
    used: AtomicBool,
    ctx: LinkContext<T>,
}

impl<T: MessageId> Connection<T> {
    pub(crate) fn new(ctx: LinkContext<T>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        Self {
            id: ConnectionId::next(),
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                outgoing: ThreadSafeQueue::new(),
                peer: Mutex::new(None),
            }),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            used: AtomicBool::new(false),
            ctx,
        }
    }

    /// Process-unique id of this link
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True only while the link carries traffic
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Remote address, once known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock_unpoisoned(&self.shared.peer)
    }

    /// Items waiting behind the write in flight
    pub fn outgoing_count(&self) -> usize {
        self.shared.outgoing.len()
    }

    /// Whether this link runs over TLS
    pub fn is_tls(&self) -> bool {
        self.ctx.tls.is_some()
    }

    fn claim(&self) -> Option<mpsc::UnboundedReceiver<Command<T>>> {
        if self.used.swap(true, Ordering::AcqRel) {
            return None;
        }
        lock_unpoisoned(&self.command_rx).take()
    }

    /// Resolve `host:port` and connect to the first endpoint that answers.
    ///
    /// Resolves `Ok(true)` once the link is ready for traffic, `Ok(false)` if
    /// any step fails, and `Err(AlreadyConnected)` on a used instance.
    pub fn connect(&self, host: &str, port: u16) -> Completion {
        self.start_outbound(Target::Host {
            host: host.to_string(),
            port,
        })
    }

    /// Connect to already resolved endpoints, tried in order.
    pub fn connect_to(&self, endpoints: Vec<SocketAddr>, server_name: &str) -> Completion {
        self.start_outbound(Target::Endpoints {
            addrs: endpoints,
            server_name: server_name.to_string(),
        })
    }

    fn start_outbound(&self, target: Target) -> Completion {
        let Some(commands) = self.claim() else {
            warn!(conn = %self.id, "{}", constants::ERR_ALREADY_CONNECTED);
            return Completion::failed(WireError::AlreadyConnected);
        };

        let (resolver, handle) = completion();
        self.shared.set_state(ConnectionState::Connecting);

        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let ctx = self.ctx.clone();
        self.ctx.runtime.spawn(async move {
            let limit = ctx.establish_timeout;
            let attempt = establish_outbound(id, &shared, &ctx, &target);
            let outcome = match timeout(limit, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => Err(WireError::ConnectFailure(format!(
                    "timed out after {limit:?}"
                ))),
            };

            match outcome {
                Ok(stream) => {
                    let driver = Driver::arm(id, shared, ctx.clone(), stream, commands);
                    ctx.inbox.connected(id);
                    resolver.resolve(true);
                    driver.run().await;
                }
                Err(e) => {
                    error!(conn = %id, target = %target, error = %e, "Connect failed");
                    ctx.metrics.connection_error();
                    shared.set_state(ConnectionState::Disconnected);
                    ctx.inbox.disconnected(id);
                    resolver.resolve(false);
                }
            }
        });

        handle
    }

    /// Server side: take ownership of an accepted socket and finish the TLS
    /// handshake if the interface uses TLS. Reading starts with
    /// [`start_listening`](Self::start_listening).
    #[instrument(skip(self, stream), fields(conn = %self.id))]
    pub(crate) async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<WireStream> {
        if self.used.load(Ordering::Acquire) {
            return Err(WireError::AlreadyConnected);
        }
        self.shared.set_peer(Some(peer));
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(tls) = &self.ctx.tls else {
            return Ok(WireStream::Plain(stream));
        };

        self.shared.set_state(ConnectionState::Handshaking);
        let outcome = match timeout(self.ctx.establish_timeout, tls.accept(stream)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WireError::HandshakeFailure("timed out".into())),
        };

        if outcome.is_err() {
            self.ctx.metrics.handshake_failed();
            self.shared.set_state(ConnectionState::Disconnected);
        }
        outcome
    }

    /// Arm the read pipeline on an established stream.
    pub(crate) fn start_listening(&self, stream: WireStream) -> bool {
        let Some(commands) = self.claim() else {
            warn!(conn = %self.id, "{}", constants::ERR_ALREADY_CONNECTED);
            return false;
        };

        let driver = Driver::arm(
            self.id,
            Arc::clone(&self.shared),
            self.ctx.clone(),
            stream,
            commands,
        );
        self.ctx.runtime.spawn(driver.run());
        true
    }

    /// Queue `message` for writing.
    ///
    /// Resolves `Ok(false)` without touching the queue when not connected,
    /// `Ok(true)` once the frame is written, `Err(WriteFailure)` if the write
    /// breaks part-way. Items still queued when the link closes resolve
    /// `Ok(false)`.
    ///
    /// A body over the payload limit fails with `Err(OversizedFrame)` right
    /// away; the link and its queue are left alone.
    pub fn send(&self, message: Message<T>, strategy: SendStrategy) -> Completion {
        if !self.is_connected() {
            debug!(conn = %self.id, "{}", constants::ERR_NOT_CONNECTED);
            return Completion::ready(false);
        }
        if message.size() > self.ctx.max_payload {
            warn!(
                conn = %self.id,
                size = message.size(),
                limit = self.ctx.max_payload,
                "Refusing oversized message"
            );
            return Completion::failed(WireError::OversizedFrame(message.size() as u64));
        }

        let (resolver, handle) = completion();
        let item = OutgoingItem { message, resolver };
        // A closed channel drops the item, which reads as Ok(false).
        let _ = self.commands.send(Command::Send(item, strategy));
        handle
    }

    /// Close the link.
    ///
    /// Resolves `Ok(false)` when there is nothing to close, `Ok(true)` once
    /// the socket is closed, or the error the close itself produced.
    pub fn disconnect(&self) -> Completion {
        if self.state() == ConnectionState::Disconnected {
            return Completion::ready(false);
        }

        let (resolver, handle) = completion();
        let _ = self.commands.send(Command::Disconnect(resolver));
        handle
    }
}

impl<T: MessageId> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .field("outgoing", &self.outgoing_count())
            .finish()
    }
}

#[instrument(skip_all, fields(conn = %id, target = %target))]
async fn establish_outbound<T>(
    id: ConnectionId,
    shared: &Shared<T>,
    ctx: &LinkContext<T>,
    target: &Target,
) -> Result<WireStream> {
    let (endpoints, server_name) = match target {
        Target::Host { host, port } => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| WireError::Resolve(format!("{host}:{port}: {e}")))?
                .collect();
            (addrs, host.as_str())
        }
        Target::Endpoints { addrs, server_name } => (addrs.clone(), server_name.as_str()),
    };

    if endpoints.is_empty() {
        return Err(WireError::Resolve(constants::ERR_NO_ENDPOINTS.into()));
    }

    let mut last_error = None;
    let mut connected = None;
    for addr in &endpoints {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                connected = Some((stream, *addr));
                break;
            }
            Err(e) => {
                debug!(endpoint = %addr, error = %e, "Endpoint refused");
                last_error = Some(e);
            }
        }
    }

    let Some((stream, peer)) = connected else {
        let reason = last_error.map_or_else(|| "no endpoint answered".to_string(), |e| e.to_string());
        return Err(WireError::ConnectFailure(reason));
    };

    shared.set_peer(Some(peer));
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    info!(%peer, "TCP connection established");

    match &ctx.tls {
        None => Ok(WireStream::Plain(stream)),
        Some(tls) => {
            shared.set_state(ConnectionState::Handshaking);
            tls.connect(server_name, stream).await.map_err(|e| {
                ctx.metrics.handshake_failed();
                e
            })
        }
    }
}

type Reader<T> = FramedRead<ReadHalf<WireStream>, FrameCodec<T>>;
type Writer<T> = FramedWrite<WriteHalf<WireStream>, FrameCodec<T>>;
type WriteFuture<T> = Pin<Box<dyn Future<Output = (Writer<T>, Result<()>)> + Send>>;

struct InFlight<T> {
    resolver: Resolver,
    bytes: u64,
    future: WriteFuture<T>,
}

enum Closing {
    Requested(Resolver),
    PeerClosed,
    ReadFailed(WireError),
    WriteFailed,
    HandleDropped,
}

/// Owns the socket of one connection and runs its pipelines
struct Driver<T: MessageId> {
    id: ConnectionId,
    shared: Arc<Shared<T>>,
    ctx: LinkContext<T>,
    reader: Reader<T>,
    /// `None` while the writer is lent to the write in flight
    writer: Option<Writer<T>>,
    in_flight: Option<InFlight<T>>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
}

impl<T: MessageId> Driver<T> {
    fn arm(
        id: ConnectionId,
        shared: Arc<Shared<T>>,
        ctx: LinkContext<T>,
        stream: WireStream,
        commands: mpsc::UnboundedReceiver<Command<T>>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, FrameCodec::with_max_payload(ctx.max_payload));
        let writer = FramedWrite::new(write_half, FrameCodec::with_max_payload(ctx.max_payload));

        shared.set_state(ConnectionState::Connected);
        ctx.metrics.connection_established();
        debug!(conn = %id, "Read pipeline armed");

        Self {
            id,
            shared,
            ctx,
            reader,
            writer: Some(writer),
            in_flight: None,
            commands,
        }
    }

    async fn run(mut self) {
        let closing = loop {
            self.start_next_write();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(item, strategy)) => self.enqueue(item, strategy),
                    Some(Command::Disconnect(resolver)) => break Closing::Requested(resolver),
                    None => break Closing::HandleDropped,
                },
                frame = self.reader.next() => match frame {
                    Some(Ok(message)) => self.deliver(message),
                    Some(Err(e)) => break Closing::ReadFailed(read_failure(e)),
                    None => break Closing::PeerClosed,
                },
                (writer, result) = write_finished(&mut self.in_flight) => {
                    self.writer = Some(writer);
                    if !self.finish_write(result) {
                        break Closing::WriteFailed;
                    }
                },
            }
        };

        self.close(closing).await;
    }

    fn enqueue(&mut self, mut item: OutgoingItem<T>, strategy: SendStrategy) {
        if item.message.timestamp() == 0 {
            item.message.set_timestamp(current_timestamp_millis());
        }

        let was_idle = self.in_flight.is_none() && self.shared.outgoing.is_empty();
        match strategy {
            SendStrategy::Immediate => self.shared.outgoing.push_front(item),
            SendStrategy::Normal | SendStrategy::Compressed | SendStrategy::Encrypted => {
                self.shared.outgoing.push_back(item)
            }
        }

        if was_idle {
            debug!(conn = %self.id, "Write pipeline started");
        }
    }

    fn start_next_write(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let Some(item) = self.shared.outgoing.pop_front() else {
            self.writer = Some(writer);
            return;
        };

        let OutgoingItem { message, resolver } = item;
        let bytes = (MessageHeader::<T>::wire_len() + message.size()) as u64;
        let future: WriteFuture<T> = Box::pin(async move {
            let result = writer.send(message).await;
            (writer, result)
        });

        self.in_flight = Some(InFlight {
            resolver,
            bytes,
            future,
        });
    }

    /// Settle the write that just finished. False means the link is broken.
    fn finish_write(&mut self, result: Result<()>) -> bool {
        let Some(done) = self.in_flight.take() else {
            return true;
        };

        match result {
            Ok(()) => {
                self.ctx.metrics.message_sent(done.bytes);
                done.resolver.resolve(true);
                true
            }
            Err(e) => {
                self.ctx.metrics.write_error();
                if e.is_peer_closed() {
                    info!(conn = %self.id, error = %e, "Peer went away during write");
                } else {
                    error!(conn = %self.id, error = %e, "Write failed");
                }
                done.resolver.fail(WireError::WriteFailure(e.to_string()));
                false
            }
        }
    }

    fn deliver(&mut self, mut message: Message<T>) {
        let bytes = (MessageHeader::<T>::wire_len() + message.size()) as u64;
        self.ctx.metrics.message_received(bytes);
        debug!(conn = %self.id, id = ?message.id(), bytes, "Frame received");

        message.set_origin(self.id);
        self.ctx.inbox.push(message);
    }

    async fn close(mut self, closing: Closing) {
        self.shared.set_state(ConnectionState::Disconnecting);

        match &closing {
            Closing::Requested(_) => debug!(conn = %self.id, "Disconnect requested"),
            Closing::PeerClosed => info!(conn = %self.id, "Peer closed the connection"),
            Closing::ReadFailed(e) if e.is_peer_closed() => {
                info!(conn = %self.id, error = %e, "Peer went away")
            }
            Closing::ReadFailed(e) => {
                error!(conn = %self.id, error = %e, "Closing after read error")
            }
            Closing::WriteFailed => debug!(conn = %self.id, "Closing after write failure"),
            Closing::HandleDropped => debug!(conn = %self.id, "Connection handle dropped"),
        }

        if let Some(interrupted) = self.in_flight.take() {
            interrupted
                .resolver
                .fail(WireError::WriteFailure(constants::ERR_CONNECTION_CLOSED.into()));
        }

        let dropped = self.shared.outgoing.drain_all().len();
        if dropped > 0 {
            debug!(conn = %self.id, dropped, "Discarded unsent messages");
        }

        // Half-close the write side first so TLS can send close_notify.
        let shutdown = match self.writer.as_mut() {
            Some(writer) => writer.get_mut().shutdown().await,
            None => Ok(()),
        };
        let shutdown = match shutdown {
            Err(e) if !is_disconnect_error(&e) => Err(WireError::Io(e)),
            _ => Ok(()),
        };

        self.writer = None;
        self.shared.set_state(ConnectionState::Disconnected);
        self.ctx.metrics.connection_closed();
        info!(conn = %self.id, "Connection closed");
        self.ctx.inbox.disconnected(self.id);

        match closing {
            Closing::Requested(resolver) => resolver.complete(shutdown.map(|()| true)),
            _ => {
                if let Err(e) = shutdown {
                    warn!(conn = %self.id, error = %e, "Socket shutdown failed");
                }
            }
        }
    }
}

impl<T: MessageId> Drop for Driver<T> {
    fn drop(&mut self) {
        // Covers the executor being torn down with this driver still running.
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

/// Peer-gone errors pass through for quiet logging; anything else is a
/// broken read.
fn read_failure(error: WireError) -> WireError {
    if error.is_peer_closed() {
        error
    } else {
        WireError::ReadFailure(error.to_string())
    }
}

/// Wait for the write in flight, or forever if there is none.
///
/// The slot is left in place so the outcome can be settled by the caller
/// and a cancelled `select!` branch loses nothing.
async fn write_finished<T>(slot: &mut Option<InFlight<T>>) -> (Writer<T>, Result<()>) {
    match slot.as_mut() {
        Some(in_flight) => (&mut in_flight.future).await,
        None => std::future::pending().await,
    }
}

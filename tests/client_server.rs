//! End-to-end tests: one server, several clients, plain TCP and TLS
//!
//! Every interface drives its sockets on its own I/O thread, so the tests
//! poll observable state with a deadline instead of sleeping blindly.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framewire::config::NetworkConfig;
use framewire::{
    ClientHandler, ClientInterface, Connection, ConnectionId, ConnectionState, Message, RunPolicy,
    SendStrategy, ServerHandle, ServerHandler, ServerInterface, TlsOptions, VerifyMode,
};

const NEWS: u32 = 7;
const PING: u32 = 9;
const PONG: u32 = 10;

const DEADLINE: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Default)]
struct EchoServer {
    received: Vec<(u32, ConnectionId)>,
    connects: usize,
    disconnects: usize,
}

impl ServerHandler<u32> for EchoServer {
    fn on_message(
        &mut self,
        server: &ServerHandle<u32>,
        mut message: Message<u32>,
        origin: Option<Arc<Connection<u32>>>,
    ) {
        let Some(client) = origin else {
            return;
        };
        self.received.push((message.id(), client.id()));

        if message.id() == PING {
            let text: String = message.pop().unwrap();
            let reply = Message::new(PONG).with(&text);
            drop(server.send(&client, reply, SendStrategy::Normal));
        }
    }

    fn on_client_connect(&mut self, _server: &ServerHandle<u32>, _connection: Arc<Connection<u32>>) {
        self.connects += 1;
    }

    fn on_client_disconnect(&mut self, _server: &ServerHandle<u32>, _id: ConnectionId) {
        self.disconnects += 1;
    }
}

#[derive(Default)]
struct Tally {
    per_id: HashMap<u32, usize>,
    last_text: Option<String>,
    connects: usize,
    disconnects: usize,
}

impl ClientHandler<u32> for Tally {
    fn on_message(&mut self, mut message: Message<u32>, _origin: Option<Arc<Connection<u32>>>) {
        *self.per_id.entry(message.id()).or_default() += 1;
        if message.id() == PONG {
            self.last_text = message.pop().ok();
        }
    }

    fn on_connect(&mut self, _connection: Arc<Connection<u32>>) {
        self.connects += 1;
    }

    fn on_disconnect(&mut self, _id: ConnectionId) {
        self.disconnects += 1;
    }
}

fn count(client: &ClientInterface<u32, Tally>, id: u32) -> usize {
    client.handler().per_id.get(&id).copied().unwrap_or(0)
}

fn all_accepted<H: ServerHandler<u32>>(server: &ServerInterface<u32, H>, expected: usize) -> bool {
    wait_until(|| {
        let connections = server.connections();
        connections.len() == expected && connections.iter().all(|c| c.is_connected())
    })
}

fn connect_clients(port: u16, config: &NetworkConfig, n: usize) -> Vec<ClientInterface<u32, Tally>> {
    (0..n)
        .map(|_| {
            let client = ClientInterface::<u32, _>::with_config(Tally::default(), config).unwrap();
            assert!(!client.is_connected());
            assert!(client.connect("127.0.0.1", port).wait().unwrap());
            assert!(client.is_connected());
            client.run(RunPolicy::NonBlocking).unwrap();
            client
        })
        .collect()
}

/// Self-signed identity for `localhost`, written as PEM files.
fn write_identity(dir: &Path) -> TlsOptions {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    TlsOptions::new()
        .set_certificate_file(cert_path)
        .set_private_key_file(key_path)
        .set_verify_mode(VerifyMode::None)
}

/// Broadcast, request/reply, kick and shutdown against three clients.
fn exercise_server(server: &ServerInterface<u32, EchoServer>, clients: &[ClientInterface<u32, Tally>]) {
    assert!(all_accepted(server, clients.len()));

    // Each client sees the broadcast exactly once.
    let results = server.send_all(None, &Message::new(NEWS).with(&1u8), SendStrategy::Normal);
    assert_eq!(results.len(), clients.len());
    for (_, done) in results {
        assert!(done.wait().unwrap());
    }
    for client in clients {
        assert!(wait_until(|| count(client, NEWS) == 1));
    }

    // Request/reply through the origin handed to the server handler.
    assert!(clients[1]
        .send(Message::new(PING).with("hello"), SendStrategy::Normal)
        .wait()
        .unwrap());
    assert!(wait_until(|| count(&clients[1], PONG) == 1));
    assert_eq!(clients[1].handler().last_text.as_deref(), Some("hello"));
    assert_eq!(count(&clients[0], PONG), 0);

    // Broadcast that skips one client.
    let skipped = server.connections()[0].id();
    let results = server.send_all(Some(skipped), &Message::new(NEWS), SendStrategy::Immediate);
    assert_eq!(results.len(), clients.len() - 1);
    assert!(results.iter().all(|(id, _)| *id != skipped));
    for (_, done) in results {
        assert!(done.wait().unwrap());
    }

    assert!(wait_until(|| clients.iter().map(|c| count(c, NEWS)).sum::<usize>() == 5));
    assert!(wait_until(|| server.handler().connects == clients.len()));
    assert!(server
        .handler()
        .received
        .iter()
        .any(|(id, _)| *id == PING));

    // Kick drops the client from the registry and closes its link.
    let victim = server.connections()[0].clone();
    assert!(server.kick(&victim).wait().unwrap());
    assert!(!victim.is_connected());
    assert_eq!(server.connection_count(), clients.len() - 1);
    assert!(wait_until(|| clients.iter().filter(|c| !c.is_connected()).count() == 1));
    assert!(wait_until(|| server.handler().disconnects == 1));

    // Shutdown closes everything still open.
    server.shutdown();
    assert!(!server.is_listening());
    assert_eq!(server.connection_count(), 0);
    assert!(wait_until(|| clients.iter().all(|c| !c.is_connected())));
    for client in clients {
        assert!(wait_until(|| client.handler().disconnects == 1));
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.handler().connects, 1);
    }
}

#[test]
fn test_plain_server_round_trip() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();
    server.run(RunPolicy::NonBlocking).unwrap();
    let port = server.local_addr().unwrap().port();

    let clients = connect_clients(port, &NetworkConfig::default(), 3);
    assert!(clients.iter().all(|c| !c.connection().unwrap().is_tls()));

    exercise_server(&server, &clients);
    assert!(server.metrics().snapshot().connections_total >= 3);
}

#[test]
fn test_tls_server_round_trip() {
    framewire::init_logging(&NetworkConfig::default().logging).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let tls = write_identity(dir.path());

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.bind_address = "127.0.0.1".to_string();
        c.transport.tls = Some(tls.clone());
    });
    let server = ServerInterface::<u32, _>::with_config(EchoServer::default(), &config).unwrap();
    server.start(0).unwrap();
    server.run(RunPolicy::NonBlocking).unwrap();
    let port = server.local_addr().unwrap().port();

    let client_config = NetworkConfig::default_with_overrides(|c| {
        c.transport.tls = Some(TlsOptions::new().set_verify_mode(VerifyMode::None));
    });
    let clients = connect_clients(port, &client_config, 3);
    assert!(clients.iter().all(|c| c.connection().unwrap().is_tls()));

    exercise_server(&server, &clients);
    assert_eq!(server.metrics().snapshot().handshakes_failed, 0);
}

#[test]
fn test_plain_client_rejected_by_tls_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.handshake_timeout = Duration::from_millis(500);
        c.transport.tls = Some(write_identity(dir.path()));
    });
    let server = ServerInterface::<u32, _>::with_config(EchoServer::default(), &config).unwrap();
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    // TCP succeeds, but the client never speaks TLS.
    let client = ClientInterface::<u32, _>::new(Tally::default()).unwrap();
    assert!(client.connect("127.0.0.1", port).wait().unwrap());
    drop(client.send(Message::new(NEWS).with(&vec![0u8; 64]), SendStrategy::Normal));

    assert!(wait_until(|| server.metrics().snapshot().handshakes_failed == 1));
    assert_eq!(server.connection_count(), 0);
    assert!(wait_until(|| !client.is_connected()));
}

#[test]
fn test_broadcast_survives_dead_connection() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    // No dispatch on the server side, so dead links stay registered.
    let clients = connect_clients(port, &NetworkConfig::default(), 3);
    assert!(all_accepted(&server, 3));

    let dead = server.connections()[1].clone();
    assert!(dead.disconnect().wait().unwrap());
    assert!(!dead.disconnect().wait().unwrap());
    assert_eq!(server.connection_count(), 3);

    let results = server.send_all(None, &Message::new(NEWS), SendStrategy::Normal);
    assert_eq!(results.len(), 3);

    let mut delivered = 0;
    for (id, done) in results {
        let ok = done.wait().unwrap();
        assert_eq!(ok, id != dead.id());
        delivered += usize::from(ok);
    }
    assert_eq!(delivered, 2);

    assert!(wait_until(|| clients.iter().filter(|c| c.is_connected()).count() == 2));
    let alive: Vec<_> = clients.iter().filter(|c| c.is_connected()).collect();
    assert!(wait_until(|| alive.iter().all(|c| count(c, NEWS) == 1)));
}

#[test]
fn test_client_reconnect_replaces_connection() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = ClientInterface::<u32, _>::new(Tally::default()).unwrap();
    assert!(client.connect("127.0.0.1", port).wait().unwrap());
    let first = client.connection().unwrap();

    assert!(client.connect("localhost", port).wait().unwrap());
    let second = client.connection().unwrap();

    assert_ne!(first.id(), second.id());
    assert!(wait_until(|| !first.is_connected()));
    assert!(second.is_connected());

    assert!(client.disconnect().wait().unwrap());
    assert!(!client.is_connected());
    assert!(!client
        .send(Message::new(NEWS), SendStrategy::Normal)
        .wait()
        .unwrap());
}

#[tokio::test]
async fn test_shutdown_from_async_context() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = ClientInterface::<u32, _>::new(Tally::default()).unwrap();
    assert!(client.connect("127.0.0.1", port).await.unwrap());

    let deadline = Instant::now() + DEADLINE;
    while server.connection_count() < 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connection_count(), 1);

    server.shutdown();
    assert!(!server.is_listening());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_closed_clients_pruned_without_dispatch() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    let first = ClientInterface::<u32, _>::new(Tally::default()).unwrap();
    assert!(first.connect("127.0.0.1", port).wait().unwrap());
    assert!(all_accepted(&server, 1));
    let stale = server.connections()[0].clone();

    assert!(first.disconnect().wait().unwrap());
    assert!(wait_until(|| stale.state() == ConnectionState::Disconnected));
    // Nothing dispatches the disconnect, so the entry is still there.
    assert_eq!(server.connection_count(), 1);

    let second = ClientInterface::<u32, _>::new(Tally::default()).unwrap();
    assert!(second.connect("127.0.0.1", port).wait().unwrap());
    assert!(wait_until(|| {
        let connections = server.connections();
        connections.len() == 1 && connections[0].id() != stale.id()
    }));
}

#[test]
fn test_stop_returns_after_blocking_loop_on_other_thread() {
    let server = ServerInterface::<u32, _>::new(EchoServer::default());
    server.start(0).unwrap();

    thread::scope(|scope| {
        let runner = scope.spawn(|| server.run(RunPolicy::Blocking));
        assert!(wait_until(|| server.is_running()));

        server.stop();
        assert!(!server.is_running());
        runner.join().unwrap().unwrap();
    });

    // The inbox is free again for a new loop.
    server.run(RunPolicy::NonBlocking).unwrap();
    assert!(server.is_running());
    server.shutdown();
    assert!(!server.is_running());
}

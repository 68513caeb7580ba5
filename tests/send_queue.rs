//! Outgoing queue behaviour, observed from a raw TCP peer
//!
//! The peer is a plain `std` socket that only reads when the test says so,
//! which lets the client's kernel buffers fill up and its queue back up.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use framewire::config::NetworkConfig;
use framewire::{
    ClientHandler, ClientInterface, Completion, Connection, FrameCodec, Message, SendStrategy,
    WireError,
};
use tokio_util::codec::Decoder;

const BULK: u32 = 1;
const URGENT: u32 = 2;
const FRAMES: u32 = 64;
const FRAME_BYTES: usize = 512 * 1024;

struct Quiet;

impl ClientHandler<u32> for Quiet {
    fn on_message(&mut self, _message: Message<u32>, _origin: Option<Arc<Connection<u32>>>) {}
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn connect_to_raw_peer(config: &NetworkConfig) -> (ClientInterface<u32, Quiet>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = ClientInterface::<u32, _>::with_config(Quiet, config).unwrap();
    assert!(client.connect("127.0.0.1", port).wait().unwrap());

    let (peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    (client, peer)
}

fn read_frames(peer: &mut TcpStream, count: usize) -> Vec<Message<u32>> {
    let mut codec = FrameCodec::<u32>::new();
    let mut buf = BytesMut::new();
    let mut chunk = vec![0u8; 64 * 1024];
    let mut frames = Vec::with_capacity(count);

    while frames.len() < count {
        if let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
            continue;
        }
        let read = peer.read(&mut chunk).unwrap();
        assert!(read > 0, "peer stream ended after {} frames", frames.len());
        buf.extend_from_slice(&chunk[..read]);
    }
    frames
}

/// Queue enough bulk frames that most of them wait behind full socket
/// buffers, then wait until the writer has stalled.
fn queue_backlog(client: &ClientInterface<u32, Quiet>) -> Vec<Completion> {
    let payload = vec![0u8; FRAME_BYTES];
    let pending: Vec<_> = (0..FRAMES)
        .map(|seq| {
            let msg = Message::new(BULK).with(&payload).with(&seq);
            client.send(msg, SendStrategy::Normal)
        })
        .collect();

    let connection = client.connection().unwrap();
    assert!(wait_until(|| connection.outgoing_count() > 0));
    thread::sleep(Duration::from_millis(200));
    assert!(connection.outgoing_count() > 0, "writer never stalled");
    pending
}

#[test]
fn test_immediate_jumps_queued_but_not_in_flight_write() {
    let (client, mut peer) = connect_to_raw_peer(&NetworkConfig::default());
    let bulk = queue_backlog(&client);

    let urgent = client.send(
        Message::new(URGENT).with(&u32::MAX),
        SendStrategy::Immediate,
    );

    let frames = read_frames(&mut peer, FRAMES as usize + 1);
    let order: Vec<(u32, u32)> = frames
        .into_iter()
        .map(|mut frame| (frame.id(), frame.pop::<u32>().unwrap()))
        .collect();

    let position = order
        .iter()
        .position(|(id, _)| *id == URGENT)
        .expect("urgent frame arrives");
    assert_eq!(order[position].1, u32::MAX);

    // At least one frame was on the wire already and at least one was passed.
    assert!(position >= 1);
    assert!(position < FRAMES as usize);

    let bulk_order: Vec<u32> = order
        .iter()
        .filter(|(id, _)| *id == BULK)
        .map(|(_, seq)| *seq)
        .collect();
    assert_eq!(bulk_order, (0..FRAMES).collect::<Vec<_>>());

    assert!(urgent.wait().unwrap());
    for done in bulk {
        assert!(done.wait().unwrap());
    }
}

#[test]
fn test_broken_peer_fails_in_flight_and_drops_queue() {
    let (client, peer) = connect_to_raw_peer(&NetworkConfig::default());
    let pending = queue_backlog(&client);

    // Closing with unread data resets the connection.
    drop(peer);

    let outcomes: Vec<_> = pending.into_iter().map(Completion::wait).collect();
    let failed = outcomes
        .iter()
        .position(Result::is_err)
        .expect("the write in flight fails");

    assert!(matches!(outcomes[failed], Err(WireError::WriteFailure(_))));
    assert!(outcomes[..failed].iter().all(|o| matches!(o, Ok(true))));
    assert!(failed + 1 < outcomes.len());
    assert!(outcomes[failed + 1..].iter().all(|o| matches!(o, Ok(false))));

    assert!(wait_until(|| !client.is_connected()));
    assert!(!client
        .send(Message::new(BULK), SendStrategy::Normal)
        .wait()
        .unwrap());
}

#[test]
fn test_oversized_send_fails_locally_and_keeps_link() {
    let config = NetworkConfig::default_with_overrides(|c| c.transport.max_payload_size = 16);
    let (client, mut peer) = connect_to_raw_peer(&config);

    let outcome = client
        .send(Message::new(BULK).with(&vec![7u8; 64]), SendStrategy::Normal)
        .wait();
    assert!(matches!(outcome, Err(WireError::OversizedFrame(72))));
    assert!(client.is_connected());
    assert_eq!(client.connection().unwrap().outgoing_count(), 0);

    assert!(client
        .send(Message::new(BULK).with(&5u32), SendStrategy::Normal)
        .wait()
        .unwrap());

    let mut frames = read_frames(&mut peer, 1);
    assert_eq!(frames[0].pop::<u32>().unwrap(), 5);
    assert!(client.is_connected());
}

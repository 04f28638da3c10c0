//! End-to-end exchanges against a scripted broker on a loopback socket.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use linemq_client::{
    Client, ClientConfig, ClientError, Conn, MemPersistence, Persistence, Receiver,
    LOCAL_KEY_FLAG, SUBSCRIPTION_PACKET_ID,
};

/// Client configuration dialing the scripted broker, with a short backoff so
/// reconnect tests run quickly.
fn config_for(listener: &TcpListener) -> ClientConfig {
    let addr = listener.local_addr().unwrap();
    ClientConfig::new(move || {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream) as Conn)
    })
    .client_id("session-test")
    .retry_delay(Duration::from_millis(20))
}

/// The broker side of one connection: accepts, validates the CONNECT, and
/// answers with a clean CONNACK.
struct Broker {
    stream: TcpStream,
}

impl Broker {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut broker = Broker { stream };

        let (first, body) = broker.read_packet();
        assert_eq!(first >> 4, 1, "expected CONNECT");
        assert_eq!(&body[..8], b"\x00\x04MQTT\x04\x02");
        broker.send(&[0x20, 2, 0, 0]);
        broker
    }

    fn read_packet(&mut self) -> (u8, Vec<u8>) {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).unwrap();
        let first = byte[0];

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            self.stream.read_exact(&mut byte).unwrap();
            remaining |= ((byte[0] & 0x7F) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; remaining];
        self.stream.read_exact(&mut body).unwrap();
        (first, body)
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }
}

#[derive(Default)]
struct Capture {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Capture {
    fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl Receiver for Capture {
    fn on_message(&self, topic: &str, message: &[u8]) {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), message.to_vec()));
    }
}

fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timeout awaiting {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn publish_at_most_once_wire_format() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = Client::new(config_for(&listener));
    let mut broker = Broker::accept(&listener);

    client.publish("test/q0", b"Hello World!").unwrap();

    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x30);
    assert_eq!(body, b"\x00\x07test/q0Hello World!");

    client.disconnect().unwrap();
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0xE0);
    assert!(body.is_empty());
}

#[test]
fn publish_at_least_once_full_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));
    let mut broker = Broker::accept(&listener);

    client
        .publish_at_least_once("test/one", b"Hello World!")
        .unwrap();
    // durable before (and while) the packet is on the wire
    assert_eq!(persistence.entries().unwrap().len(), 1);

    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x32);
    assert_eq!(&body[..10], b"\x00\x08test/one");
    let id = u16::from_be_bytes([body[10], body[11]]);
    assert_eq!(id, 0x8000);
    assert_eq!(&body[12..], b"Hello World!");
    assert_eq!(
        persistence.entries().unwrap()[0].0,
        LOCAL_KEY_FLAG | id as u32
    );

    broker.send(&[0x40, 2, body[10], body[11]]);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
    wait_until("line drain", || client.pending() == 0);
}

#[test]
fn publish_exactly_once_full_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));
    let mut broker = Broker::accept(&listener);

    client.publish_exactly_once("test/two", b"payload").unwrap();

    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x34);
    let id = u16::from_be_bytes([body[10], body[11]]);
    assert_eq!(id, 0x4000);

    // first acknowledgement swaps the stored PUBLISH for a PUBREL
    broker.send(&[0x50, 2, body[10], body[11]]);
    let (first, rel_body) = broker.read_packet();
    assert_eq!(first, 0x62);
    assert_eq!(rel_body, [body[10], body[11]]);
    wait_until("stored release", || {
        persistence
            .load(LOCAL_KEY_FLAG | id as u32)
            .unwrap()
            .map(|record| record.as_ref() == [0x62, 2, body[10], body[11]])
            .unwrap_or(false)
    });

    broker.send(&[0x70, 2, body[10], body[11]]);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
    wait_until("line drain", || client.pending() == 0);
}

#[test]
fn reconnect_replays_publish_with_dup() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));

    let mut broker = Broker::accept(&listener);
    client
        .publish_at_least_once("test/redo", b"Hello World!")
        .unwrap();
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x32);
    drop(broker); // connection lost before the acknowledgement

    let mut broker = Broker::accept(&listener);
    let (replayed_first, replayed_body) = broker.read_packet();
    assert_eq!(replayed_first, 0x3A, "replay must carry DUP");
    assert_eq!(replayed_body, body, "replay must keep the packet identifier");

    let id_at = replayed_body.len() - b"Hello World!".len() - 2;
    broker.send(&[0x40, 2, replayed_body[id_at], replayed_body[id_at + 1]]);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
}

#[test]
fn reconnect_replays_release_only() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));

    let mut broker = Broker::accept(&listener);
    client.publish_exactly_once("test/redo2", b"x").unwrap();
    let (_, body) = broker.read_packet();
    let id_hi = body[body.len() - 3];
    let id_lo = body[body.len() - 2];

    broker.send(&[0x50, 2, id_hi, id_lo]);
    let (first, _) = broker.read_packet();
    assert_eq!(first, 0x62);
    drop(broker); // connection lost between PUBREL and PUBCOMP

    let mut broker = Broker::accept(&listener);
    let (first, rel_body) = broker.read_packet();
    assert_eq!(first, 0x62, "only the release replays after PUBREC");
    assert_eq!(rel_body, [id_hi, id_lo]);

    broker.send(&[0x70, 2, id_hi, id_lo]);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
    wait_until("line drain", || client.pending() == 0);
}

#[test]
fn inbound_all_grades() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let capture = Arc::new(Capture::default());
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(
        config_for(&listener)
            .receiver_arc(capture.clone())
            .persistence_arc(persistence.clone()),
    );
    let mut broker = Broker::accept(&listener);

    // at most once
    broker.send(b"\x30\x0e\x00\x07test/q0hello");
    wait_until("at-most-once reception", || capture.count() == 1);

    // at least once: expect the PUBACK
    broker.send(b"\x32\x0d\x00\x07test/q1\x00\x09m1");
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x40);
    assert_eq!(body, [0, 9]);
    wait_until("at-least-once reception", || capture.count() == 2);

    // exactly once: PUBREC, staged payload, then PUBREL and PUBCOMP
    broker.send(b"\x34\x0d\x00\x07test/q2\x00\x05m2");
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x50);
    assert_eq!(body, [0, 5]);
    assert_eq!(
        persistence.load(5).unwrap().unwrap().as_ref(),
        b"test/q2\x00m2"
    );
    assert_eq!(capture.count(), 2, "reception commits on the release");

    broker.send(&[0x62, 2, 0, 5]);
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x70);
    assert_eq!(body, [0, 5]);
    wait_until("exactly-once reception", || capture.count() == 3);
    wait_until("staging drain", || persistence.entries().unwrap().is_empty());

    let messages = capture.messages.lock().unwrap();
    assert_eq!(messages[0], ("test/q0".to_string(), b"hello".to_vec()));
    assert_eq!(messages[1], ("test/q1".to_string(), b"m1".to_vec()));
    assert_eq!(messages[2], ("test/q2".to_string(), b"m2".to_vec()));
}

#[test]
fn redundant_release_completes_without_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let capture = Arc::new(Capture::default());
    let client = Client::new(config_for(&listener).receiver_arc(capture.clone()));
    let mut broker = Broker::accept(&listener);

    // a PUBREL with no staged record still gets its PUBCOMP
    broker.send(&[0x62, 2, 0, 7]);
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x70);
    assert_eq!(body, [0, 7]);
    assert_eq!(capture.count(), 0);
    drop(client);
}

#[test]
fn subscribe_reports_rejected_filters() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));
    let mut broker = Broker::accept(&listener);

    thread::scope(|scope| {
        let request = scope.spawn(|| client.subscribe(&["test/a", "test/b", "test/c"]));

        let (first, body) = broker.read_packet();
        assert_eq!(first, 0x82);
        assert_eq!(
            u16::from_be_bytes([body[0], body[1]]),
            SUBSCRIPTION_PACKET_ID
        );
        assert_eq!(
            &body[2..],
            b"\x00\x06test/a\x02\x00\x06test/b\x02\x00\x06test/c\x02"
        );
        // the request is persisted until its acknowledgement
        assert!(persistence
            .load(LOCAL_KEY_FLAG | SUBSCRIPTION_PACKET_ID as u32)
            .unwrap()
            .is_some());

        broker.send(&[0x90, 5, 0, 1, 2, 0x80, 0]);
        match request.join().unwrap() {
            Err(ClientError::SubscribeRejected(rejected)) => assert_eq!(rejected, vec![1]),
            other => panic!("want rejected filter listing, got {other:?}"),
        }
    });
    wait_until("request record drain", || {
        persistence.entries().unwrap().is_empty()
    });
}

#[test]
fn subscribe_and_unsubscribe_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = Client::new(config_for(&listener));
    let mut broker = Broker::accept(&listener);

    thread::scope(|scope| {
        let request = scope.spawn(|| client.subscribe(&["test/ok"]));
        let (first, _) = broker.read_packet();
        assert_eq!(first, 0x82);
        broker.send(&[0x90, 3, 0, 1, 2]);
        request.join().unwrap().unwrap();
    });

    thread::scope(|scope| {
        let request = scope.spawn(|| client.unsubscribe(&["test/ok"]));
        let (first, body) = broker.read_packet();
        assert_eq!(first, 0xA2);
        assert_eq!(&body[2..], b"\x00\x07test/ok");
        broker.send(&[0xB0, 2, 0, 1]);
        request.join().unwrap().unwrap();
    });
}

#[test]
fn subscription_requests_are_single_flight() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = Client::new(config_for(&listener));
    let mut broker = Broker::accept(&listener);

    thread::scope(|scope| {
        let first = scope.spawn(|| client.subscribe(&["test/one"]));
        let (packet, _) = broker.read_packet();
        assert_eq!(packet, 0x82);

        let second = scope.spawn(|| client.subscribe(&["test/two"]));
        thread::sleep(Duration::from_millis(100));
        assert!(
            !second.is_finished(),
            "second request must wait for the first to complete"
        );

        broker.send(&[0x90, 3, 0, 1, 2]);
        first.join().unwrap().unwrap();

        let (packet, body) = broker.read_packet();
        assert_eq!(packet, 0x82);
        assert_eq!(&body[2..], b"\x00\x08test/two\x02");
        broker.send(&[0x90, 3, 0, 1, 2]);
        second.join().unwrap().unwrap();
    });
}

#[test]
fn concurrent_at_least_once_publishers_drain() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));
    let broker = Broker::accept(&listener);

    // acknowledge every publish as it lands
    let acks = thread::spawn(move || {
        let mut broker = broker;
        for _ in 0..100 {
            let (first, body) = broker.read_packet();
            assert_eq!(first & 0xF7, 0x32);
            // topic "test/race-1" puts the identifier at bytes 13..15
            broker.send(&[0x40, 2, body[13], body[14]]);
        }
        broker
    });

    thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                for _ in 0..10 {
                    client
                        .publish_at_least_once("test/race-1", b"Hello World!")
                        .unwrap();
                }
            });
        }
    });

    let _broker = acks.join().unwrap();
    wait_until("line drain", || client.pending() == 0);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
}

#[test]
fn concurrent_exactly_once_publishers_drain() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let persistence = Arc::new(MemPersistence::new());
    let client = Client::new(config_for(&listener).persistence_arc(persistence.clone()));
    let broker = Broker::accept(&listener);

    // drive both round trips of every exchange
    let acks = thread::spawn(move || {
        let mut broker = broker;
        let mut completed = 0;
        while completed < 50 {
            let (first, body) = broker.read_packet();
            match first & 0xF7 {
                0x34 => broker.send(&[0x50, 2, body[13], body[14]]),
                0x62 => {
                    broker.send(&[0x70, 2, body[0], body[1]]);
                    completed += 1;
                }
                other => panic!("unexpected packet head {other:#04x}"),
            }
        }
        broker
    });

    thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                for _ in 0..5 {
                    client
                        .publish_exactly_once("test/race-2", b"Hello World!")
                        .unwrap();
                }
            });
        }
    });

    let _broker = acks.join().unwrap();
    wait_until("line drain", || client.pending() == 0);
    wait_until("persistence drain", || {
        persistence.entries().unwrap().is_empty()
    });
}

#[test]
fn ping_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = Client::new(config_for(&listener));
    let mut broker = Broker::accept(&listener);

    thread::scope(|scope| {
        let request = scope.spawn(|| client.ping());
        let (first, body) = broker.read_packet();
        assert_eq!(first, 0xC0);
        assert!(body.is_empty());
        broker.send(&[0xD0, 0]);
        request.join().unwrap().unwrap();
    });
}

#[test]
fn disconnect_fails_parked_ping_with_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = Client::new(config_for(&listener));
    let mut broker = Broker::accept(&listener);

    thread::scope(|scope| {
        let request = scope.spawn(|| client.ping());
        let (first, _) = broker.read_packet();
        assert_eq!(first, 0xC0);
        // no response; cancel through disconnect instead
        client.disconnect().unwrap();
        assert!(matches!(request.join().unwrap(), Err(ClientError::Closed)));
    });

    assert!(matches!(
        client.publish("test/after", b"x"),
        Err(ClientError::Closed)
    ));
}

#[test]
fn oversized_inbound_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let capture = Arc::new(Capture::default());
    let client = Client::new(
        config_for(&listener)
            .receiver_arc(capture.clone())
            .in_size_limit(16),
    );
    let mut broker = Broker::accept(&listener);

    let mut oversized = vec![0x30, 107, 0, 5];
    oversized.extend_from_slice(b"big/t");
    oversized.extend_from_slice(&[b'x'; 100]);
    broker.send(&oversized);

    broker.send(b"\x30\x05\x00\x01sok");
    wait_until("small message reception", || capture.count() == 1);
    let messages = capture.messages.lock().unwrap();
    assert_eq!(messages[0], ("s".to_string(), b"ok".to_vec()));
}

#[test]
fn oversized_inbound_acknowledged_when_configured() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let capture = Arc::new(Capture::default());
    let client = Client::new(
        config_for(&listener)
            .receiver_arc(capture.clone())
            .in_size_limit(16)
            .ack_oversized(true),
    );
    let mut broker = Broker::accept(&listener);

    let mut oversized = vec![0x32, 109, 0, 5];
    oversized.extend_from_slice(b"big/t");
    oversized.extend_from_slice(&[0, 9]);
    oversized.extend_from_slice(&[b'x'; 100]);
    broker.send(&oversized);

    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x40);
    assert_eq!(body, [0, 9]);
    assert_eq!(capture.count(), 0, "the receiver never sees the payload");
    drop(client);
}

#[test]
fn pool_returns_clients_after_use() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let pool = linemq_client::ClientPool::with_size(1, &config_for(&listener));
    let mut broker = Broker::accept(&listener);

    pool.publish_at_least_once("test/pool", b"a").unwrap();
    let (first, body) = broker.read_packet();
    assert_eq!(first, 0x32);
    broker.send(&[0x40, 2, body[11], body[12]]);

    // the client went back to the pool and serves the next publish
    pool.publish("test/pool", b"b").unwrap();
    let (first, _) = broker.read_packet();
    assert_eq!(first, 0x30);

    pool.disconnect().unwrap();
}

//! End-to-end tests of a running engine over loopback sockets.
//!
//! Covers the flows that need several components at once:
//! 1. Leader/followers dispatch never runs one channel on two threads
//! 2. A stream transport talks to a hand-written server through `Context`
//! 3. Beacons from one context are seen by another
//! 4. A context registers with a relay and receives relayed beacons
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=chanwire=trace cargo test --features tracing --test engine -- --nocapture
//! ```

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use chanwire::protocol::{HEADER_SIZE, Header, MINOR_REVISION, Message, Status, command};
use chanwire::repeater::Repeater;
use chanwire::response::Reply;
use chanwire::runtime::{Key, LeaderFollowers, Ops, Reactor, ReactorHandler};
use chanwire::transport::{SendPriority, Transport, TransportClient};
use chanwire::{Context, ContextConfig};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        chanwire::init_tracing();
    });
}

fn loopback_config() -> ContextConfig {
    ContextConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        auto_broadcast: false,
        repeater_registration: false,
        pool_size: 3,
        ..ContextConfig::default()
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ----------------------------------------------------------------------------
// Leader/followers
// ----------------------------------------------------------------------------

/// Datagram sink that records whether it was ever entered twice at once.
struct Exclusive {
    socket: UdpSocket,
    busy: AtomicBool,
    overlaps: AtomicUsize,
    received: Arc<AtomicUsize>,
}

impl ReactorHandler for Exclusive {
    fn handle_event(&self, _key: Key, _ready: Ops) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Give other threads the chance to pick up a second event.
        thread::sleep(Duration::from_millis(2));
        let mut buf = [0u8; 64];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok(_) => {
                    self.received.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[test]
fn pool_never_runs_a_channel_twice() {
    init_test_tracing();

    let reactor = Arc::new(Reactor::new().unwrap());
    let pool = LeaderFollowers::start(reactor, 4).unwrap();
    let received = Arc::new(AtomicUsize::new(0));

    let sinks: Vec<Arc<Exclusive>> = (0..4)
        .map(|_| {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.set_nonblocking(true).unwrap();
            Arc::new(Exclusive {
                socket,
                busy: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
                received: Arc::clone(&received),
            })
        })
        .collect();
    for sink in &sinks {
        let handler: Arc<dyn ReactorHandler> = sink.clone();
        pool.register(&sink.socket, Ops::READ, handler).unwrap();
    }

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let per_sink = 50;
    for i in 0..per_sink {
        for sink in &sinks {
            sender.send_to(&[i as u8], sink.socket.local_addr().unwrap()).unwrap();
        }
        if i % 10 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let total = per_sink * sinks.len();
    assert!(
        wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst) == total),
        "received {} of {total}",
        received.load(Ordering::SeqCst)
    );
    for sink in &sinks {
        assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
    }
    pool.shutdown();
}

// ----------------------------------------------------------------------------
// Stream transport through a context
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Closed,
    Unresponsive,
    Responsive,
}

struct Watcher {
    tx: Sender<Notice>,
}

impl Watcher {
    fn new() -> (Arc<Self>, Receiver<Notice>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl TransportClient for Watcher {
    fn transport_closed(&self, _: &dyn Transport) {
        let _ = self.tx.send(Notice::Closed);
    }

    fn transport_unresponsive(&self, _: &dyn Transport) {
        let _ = self.tx.send(Notice::Unresponsive);
    }

    fn transport_responsive(&self, _: &dyn Transport) {
        let _ = self.tx.send(Notice::Responsive);
    }
}

/// Reads one standard-header message from a blocking stream.
fn read_message(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).unwrap();
    let (header, _) = Header::decode(&raw).unwrap();
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload).unwrap();
    (header, payload)
}

fn write_message(stream: &mut TcpStream, message: &Message) {
    stream.write_all(&message.to_bytes(MINOR_REVISION).unwrap()).unwrap();
}

fn accept(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

#[test]
fn stream_request_round_trip() {
    init_test_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = listener.local_addr().unwrap();
    let context = Context::new(loopback_config()).unwrap();

    let (watcher, notices) = Watcher::new();
    let transport = context.connect(watcher.clone(), server_addr, 7).unwrap();
    let mut server = accept(&listener);

    let (version, _) = read_message(&mut server);
    assert_eq!(version.command, command::VERSION);
    assert_eq!(version.data_type, 7);
    assert_eq!(version.data_count, u32::from(MINOR_REVISION));

    // Older server: the transport adopts its revision.
    write_message(&mut server, &Message::new(Header {
        data_count: 11,
        ..Header::new(command::VERSION)
    }));
    assert!(wait_until(Duration::from_secs(2), || transport.minor_revision() == 11));

    let (ioid, waiter) = context.request(Duration::from_secs(5)).unwrap();
    let read = Message::new(Header {
        data_type: 6,
        data_count: 1,
        parameter1: 42,
        parameter2: ioid.0,
        ..Header::new(command::READ_NOTIFY)
    });
    transport.submit(&read, SendPriority::Normal).unwrap();
    assert!(transport.flush());

    let (request, _) = read_message(&mut server);
    assert_eq!(request.command, command::READ_NOTIFY);
    assert_eq!(request.parameter1, 42);
    assert_eq!(request.parameter2, ioid.0);

    let value = vec![0x40, 0x09, 0x21, 0xFB, 0x54, 0x44, 0x2D, 0x18];
    write_message(
        &mut server,
        &Message::with_payload(
            Header {
                data_type: 6,
                data_count: 1,
                parameter1: Status::Normal.status_code(),
                parameter2: ioid.0,
                ..Header::new(command::READ_NOTIFY)
            },
            value.clone(),
        ),
    );
    assert_eq!(
        waiter.wait(Duration::from_secs(2)),
        Some(Reply::Data {
            data_type: 6,
            count: 1,
            payload: value,
        })
    );
    assert!(context.responses().is_empty());

    drop(server);
    assert_eq!(notices.recv_timeout(Duration::from_secs(2)), Ok(Notice::Closed));
    assert!(transport.is_closed());
    assert!(wait_until(Duration::from_secs(1), || context.transports().is_empty()));
    context.shutdown();
}

#[test]
fn transports_are_shared_per_priority() {
    init_test_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = listener.local_addr().unwrap();
    let context = Context::new(loopback_config()).unwrap();

    let (first, _first_rx) = Watcher::new();
    let (second, _second_rx) = Watcher::new();
    let a = context.connect(first.clone(), server_addr, 0).unwrap();
    let _server_a = accept(&listener);
    let b = context.connect(second.clone(), server_addr, 0).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.client_count(), 2);

    let urgent = context.connect(first.clone(), server_addr, 99).unwrap();
    let _server_urgent = accept(&listener);
    assert!(!Arc::ptr_eq(&a, &urgent));
    assert_eq!(context.transports().len(), 2);

    let first: Arc<dyn TransportClient> = first;
    let second: Arc<dyn TransportClient> = second;
    a.release(&first);
    assert!(!a.is_closed());
    a.release(&second);
    assert!(a.is_closed());
    assert_eq!(context.transports().len(), 1);

    context.shutdown();
    assert!(urgent.is_closed());
}

#[test]
fn silent_server_goes_unresponsive_and_recovers() {
    init_test_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = listener.local_addr().unwrap();
    let context = Context::new(ContextConfig {
        connection_timeout: Duration::from_millis(100),
        echo_timeout: Duration::from_millis(100),
        ..loopback_config()
    })
    .unwrap();

    let (watcher, notices) = Watcher::new();
    let transport = context.connect(watcher, server_addr, 0).unwrap();
    let mut server = accept(&listener);

    assert_eq!(read_message(&mut server).0.command, command::VERSION);
    // Idle connection is probed; the probe goes unanswered.
    assert_eq!(read_message(&mut server).0.command, command::ECHO);
    assert_eq!(
        notices.recv_timeout(Duration::from_secs(2)),
        Ok(Notice::Unresponsive)
    );
    assert!(transport.is_unresponsive());

    // A late echo triggers a fresh probe; answering that one recovers.
    write_message(&mut server, &Message::echo());
    assert_eq!(read_message(&mut server).0.command, command::ECHO);
    write_message(&mut server, &Message::echo());
    assert_eq!(
        notices.recv_timeout(Duration::from_secs(2)),
        Ok(Notice::Responsive)
    );
    assert!(!transport.is_unresponsive());
    context.shutdown();
}

// ----------------------------------------------------------------------------
// Beacons and the relay
// ----------------------------------------------------------------------------

#[test]
fn beacons_reach_another_context() {
    init_test_tracing();

    let listener = Context::new(loopback_config()).unwrap();
    let server = Context::new(ContextConfig {
        broadcast_addresses: vec![listener.datagram().local_address()],
        beacon_period: Duration::from_millis(20),
        ..loopback_config()
    })
    .unwrap();

    let emitter = server.start_beacons(6064, Ipv4Addr::LOCALHOST).unwrap();
    assert!(Arc::ptr_eq(
        &emitter,
        &server.start_beacons(6064, Ipv4Addr::LOCALHOST).unwrap()
    ));
    assert!(wait_until(Duration::from_secs(2), || emitter.sequence() >= 3));
    assert!(wait_until(Duration::from_secs(2), || listener.beacons().len() == 1));

    server.shutdown();
    listener.shutdown();
}

#[test]
fn ignored_hosts_are_not_heard() {
    init_test_tracing();

    let deaf = Context::new(ContextConfig {
        ignore_addresses: vec![Ipv4Addr::LOCALHOST.into()],
        ..loopback_config()
    })
    .unwrap();
    let beacon = Message::beacon(1, 6064, Ipv4Addr::LOCALHOST);
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..3 {
        sender
            .send_to(&beacon.to_bytes(MINOR_REVISION).unwrap(), deaf.datagram().local_address())
            .unwrap();
    }
    thread::sleep(Duration::from_millis(100));
    assert!(deaf.beacons().is_empty());
    deaf.shutdown();
}

#[test]
fn relay_confirms_and_forwards_beacons() {
    init_test_tracing();

    let relay = Repeater::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .spawn()
        .unwrap();
    let context = Context::new(ContextConfig {
        repeater_registration: true,
        repeater_port: relay.local_addr().port(),
        ..loopback_config()
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(3), || context.is_repeater_confirmed()));

    // A beacon without an address gets the sender's filled in by the relay.
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let beacon = Message::beacon(1, 6070, Ipv4Addr::UNSPECIFIED);
    server
        .send_to(&beacon.to_bytes(MINOR_REVISION).unwrap(), relay.local_addr())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || context.beacons().len() == 1));

    context.shutdown();
    relay.shutdown().unwrap();
}


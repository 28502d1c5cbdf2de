//! End-to-end scenarios over an in-memory datagram bus: clean connect
//! and echo, fragmentation, loss, replay, peer restart and rekey on
//! byte volume. The nodes are driven deterministically with a manual
//! clock and explicit poll/pump rounds; no background tasks.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wr_crypto::SigningIdentity;
use wr_link::{
    FailureReason, LinkConfig, LinkNode, ManualClock, Peer, PeerDirectory, PeerInfo, PeerRole,
    Priority, SendOutcome, Transport,
};

// ── Test collaborators ───────────────────────────────────────────────────────

#[derive(Default)]
struct Bus {
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    sent_count: Mutex<usize>,
}

impl Bus {
    fn take_all(&self) -> Vec<(SocketAddr, SocketAddr, Vec<u8>)> {
        self.queue.lock().drain(..).collect()
    }
}

struct BusTransport {
    local: SocketAddr,
    bus: Arc<Bus>,
}

impl Transport for BusTransport {
    fn send(&self, datagram: &[u8], dest: SocketAddr) {
        *self.bus.sent_count.lock() += 1;
        self.bus
            .queue
            .lock()
            .push_back((self.local, dest, datagram.to_vec()));
    }
}

#[derive(Default)]
struct TestDirectory {
    known: Mutex<HashMap<SocketAddr, PeerInfo>>,
    connected: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    disconnected: Mutex<Vec<FailureReason>>,
}

impl TestDirectory {
    fn insert(&self, info: PeerInfo) {
        self.known.lock().insert(info.address, info);
    }
}

impl PeerDirectory for TestDirectory {
    fn lookup_by_address(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.known.lock().get(addr).cloned()
    }

    fn on_connected(&self, info: &PeerInfo, reference: &[u8]) {
        self.connected.lock().push((info.address, reference.to_vec()));
    }

    fn on_disconnected(&self, _info: &PeerInfo, reason: &FailureReason) {
        self.disconnected.lock().push(reason.clone());
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct TestNode {
    node: LinkNode,
    addr: SocketAddr,
    directory: Arc<TestDirectory>,
}

struct Pair {
    a: TestNode,
    b: TestNode,
    peer_ab: Peer,
    peer_ba: Peer,
    bus: Arc<Bus>,
    clock: Arc<ManualClock>,
    received_b: Arc<Mutex<Vec<Vec<u8>>>>,
    received_a: Arc<Mutex<Vec<Vec<u8>>>>,
}

const ADDR_A: &str = "10.1.0.1:9000";
const ADDR_B: &str = "10.1.0.2:9000";

fn build_pair(cfg: LinkConfig) -> Pair {
    build_pair_with_identities(
        cfg,
        SigningIdentity::generate(),
        SigningIdentity::generate(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build_pair_with_identities(
    cfg: LinkConfig,
    id_a: SigningIdentity,
    id_b: SigningIdentity,
) -> Pair {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let bus = Arc::new(Bus::default());
    let addr_a: SocketAddr = ADDR_A.parse().unwrap();
    let addr_b: SocketAddr = ADDR_B.parse().unwrap();

    let info_a = PeerInfo {
        public_key: id_a.public_bytes(),
        address: addr_a,
        role: PeerRole::Darknet,
    };
    let info_b = PeerInfo {
        public_key: id_b.public_bytes(),
        address: addr_b,
        role: PeerRole::Darknet,
    };

    let dir_a = Arc::new(TestDirectory::default());
    dir_a.insert(info_b.clone());
    let dir_b = Arc::new(TestDirectory::default());
    dir_b.insert(info_a.clone());

    let node_a = LinkNode::new(
        cfg.clone(),
        id_a,
        b"noderef-a".to_vec(),
        Arc::new(BusTransport {
            local: addr_a,
            bus: bus.clone(),
        }),
        dir_a.clone(),
        clock.clone(),
    )
    .unwrap();
    let node_b = LinkNode::new(
        cfg,
        id_b,
        b"noderef-b".to_vec(),
        Arc::new(BusTransport {
            local: addr_b,
            bus: bus.clone(),
        }),
        dir_b.clone(),
        clock.clone(),
    )
    .unwrap();

    let peer_ab = node_a.register_peer(info_b);
    let peer_ba = node_b.register_peer(info_a);

    let received_b = Arc::new(Mutex::new(Vec::new()));
    let sink = received_b.clone();
    peer_ba.on_message(move |msg| sink.lock().push(msg.to_vec()));

    let received_a = Arc::new(Mutex::new(Vec::new()));
    let sink = received_a.clone();
    peer_ab.on_message(move |msg| sink.lock().push(msg.to_vec()));

    Pair {
        a: TestNode {
            node: node_a,
            addr: addr_a,
            directory: dir_a,
        },
        b: TestNode {
            node: node_b,
            addr: addr_b,
            directory: dir_b,
        },
        peer_ab,
        peer_ba,
        bus,
        clock,
        received_b,
        received_a,
    }
}

impl Pair {
    /// Deliver everything on the bus, including datagrams produced while
    /// handling (handshake replies), through an optional drop filter.
    fn pump(&self, drop_filter: &mut dyn FnMut(&[u8]) -> bool) {
        loop {
            let batch = self.bus.take_all();
            if batch.is_empty() {
                return;
            }
            for (from, to, datagram) in batch {
                if drop_filter(&datagram) {
                    continue;
                }
                if to == self.a.addr {
                    self.a.node.handle_datagram(&datagram, from);
                } else if to == self.b.addr {
                    self.b.node.handle_datagram(&datagram, from);
                }
            }
        }
    }

    fn round(&self, advance: Duration) {
        self.a.node.poll();
        self.b.node.poll();
        self.pump(&mut |_| false);
        self.clock.advance(advance);
    }

    fn round_with(&self, advance: Duration, drop_filter: &mut dyn FnMut(&[u8]) -> bool) {
        self.a.node.poll();
        self.b.node.poll();
        self.pump(drop_filter);
        self.clock.advance(advance);
    }

    fn connect(&self) {
        self.peer_ab.connect();
        for _ in 0..10 {
            self.round(Duration::from_millis(10));
            if self.peer_ab.is_connected() && self.peer_ba.is_connected() {
                return;
            }
        }
        panic!("handshake did not complete");
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn clean_connect_and_echo() {
    let pair = build_pair(LinkConfig::default());

    let payload = vec![0x42u8; 10];
    let mut rx = pair
        .peer_ab
        .send(payload.clone(), Priority::Normal)
        .unwrap();

    for _ in 0..20 {
        pair.round(Duration::from_millis(10));
    }

    assert!(pair.peer_ab.is_connected());
    assert!(pair.peer_ba.is_connected());
    assert_eq!(*pair.received_b.lock(), vec![payload]);
    assert_eq!(rx.try_recv().unwrap(), SendOutcome::Sent);

    // Both directories saw the connect with the opaque reference.
    let connects_a = pair.a.directory.connected.lock();
    assert_eq!(connects_a.len(), 1);
    assert_eq!(connects_a[0].1, b"noderef-b");
    let connects_b = pair.b.directory.connected.lock();
    assert_eq!(connects_b[0].1, b"noderef-a");
}

#[test]
fn echo_back_and_forth() {
    let pair = build_pair(LinkConfig::default());
    pair.connect();

    pair.peer_ab.send(b"ping over".to_vec(), Priority::High).unwrap();
    for _ in 0..10 {
        pair.round(Duration::from_millis(10));
    }
    assert_eq!(*pair.received_b.lock(), vec![b"ping over".to_vec()]);

    pair.peer_ba.send(b"pong back".to_vec(), Priority::High).unwrap();
    for _ in 0..10 {
        pair.round(Duration::from_millis(10));
    }
    assert_eq!(*pair.received_a.lock(), vec![b"pong back".to_vec()]);
}

#[test]
fn fragmentation_of_200_kib_message() {
    let pair = build_pair(LinkConfig::default());
    pair.connect();
    *pair.bus.sent_count.lock() = 0;

    let payload: Vec<u8> = (0..200 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    pair.peer_ab.send(payload.clone(), Priority::Bulk).unwrap();

    for _ in 0..60 {
        pair.round(Duration::from_millis(20));
        if pair.received_b.lock().len() == 1 {
            break;
        }
    }

    let received = pair.received_b.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], payload);

    // Data fragments dominate; everything else is a handful of ack
    // packets. The per-packet payload is MTU minus framing overhead.
    let datagrams = *pair.bus.sent_count.lock();
    let ceiling = 200 * 1024 / (1280 - 32) + 20;
    assert!(datagrams <= ceiling, "used {datagrams} datagrams");
}

#[test]
fn loss_of_every_third_datagram_is_recovered_in_order() {
    let pair = build_pair(LinkConfig::default());
    pair.connect();

    for i in 0..1000u32 {
        pair.peer_ab
            .send(i.to_be_bytes().to_vec(), Priority::Normal)
            .unwrap();
    }

    let mut counter = 0usize;
    let mut drop_every_third = move |_: &[u8]| {
        counter += 1;
        counter % 3 == 0
    };

    for _ in 0..300 {
        pair.round_with(Duration::from_millis(400), &mut drop_every_third);
        if pair.received_b.lock().len() == 1000 {
            break;
        }
    }

    let received = pair.received_b.lock();
    assert_eq!(received.len(), 1000, "all messages delivered");
    for (i, msg) in received.iter().enumerate() {
        assert_eq!(msg.as_slice(), (i as u32).to_be_bytes(), "order at {i}");
    }
}

#[test]
fn replayed_session_datagram_delivers_once() {
    let pair = build_pair(LinkConfig::default());
    pair.connect();

    pair.peer_ab.send(b"exactly once".to_vec(), Priority::Normal).unwrap();
    pair.a.node.poll();
    let batch = pair.bus.take_all();
    let (_, _, datagram) = batch
        .into_iter()
        .find(|(from, _, _)| *from == pair.a.addr)
        .expect("data datagram on the bus");

    for _ in 0..10 {
        pair.b.node.handle_datagram(&datagram, pair.a.addr);
    }

    assert_eq!(*pair.received_b.lock(), vec![b"exactly once".to_vec()]);
}

#[test]
fn tampered_handshake_traffic_never_connects() {
    let pair = build_pair(LinkConfig::default());
    pair.peer_ab.connect();

    // Corrupt a byte inside every datagram's integrity-protected region.
    for _ in 0..12 {
        pair.a.node.poll();
        pair.b.node.poll();
        let batch = pair.bus.take_all();
        for (from, to, mut datagram) in batch {
            datagram[20] ^= 0x01;
            if to == pair.a.addr {
                pair.a.node.handle_datagram(&datagram, from);
            } else if to == pair.b.addr {
                pair.b.node.handle_datagram(&datagram, from);
            }
        }
        pair.clock.advance(Duration::from_millis(100));
    }

    assert!(!pair.peer_ab.is_connected());
    assert!(!pair.peer_ba.is_connected());
    assert_eq!(pair.peer_ab.stats().handshakes_completed, 0);
    assert_eq!(pair.peer_ba.stats().handshakes_completed, 0);
}

#[test]
fn peer_restart_flushes_in_flight_state() {
    let id_a = SigningIdentity::generate();
    let id_b = SigningIdentity::generate();
    let id_b_secret = *id_b.secret_bytes();
    let pair = build_pair_with_identities(LinkConfig::default(), id_a, id_b);
    pair.connect();

    // A queues a message that never reaches the old B.
    let mut stuck_rx = pair
        .peer_ab
        .send(b"lost to the restart".to_vec(), Priority::Normal)
        .unwrap();
    pair.a.node.poll();
    let _ = pair.bus.take_all(); // old B never sees it

    // B restarts: same identity and address, fresh boot id.
    let dir_b2 = Arc::new(TestDirectory::default());
    dir_b2.insert(pair.peer_ba.info().clone());
    let node_b2 = LinkNode::new(
        LinkConfig::default(),
        SigningIdentity::from_bytes(&id_b_secret).unwrap(),
        b"noderef-b".to_vec(),
        Arc::new(BusTransport {
            local: pair.b.addr,
            bus: pair.bus.clone(),
        }),
        dir_b2,
        pair.clock.clone(),
    )
    .unwrap();
    let peer_b2a = node_b2.register_peer(pair.peer_ba.info().clone());
    peer_b2a.connect();

    // Drive the new handshake; route b-addressed traffic to the new node.
    for _ in 0..10 {
        pair.a.node.poll();
        node_b2.poll();
        let batch = pair.bus.take_all();
        for (from, to, datagram) in batch {
            if to == pair.a.addr {
                pair.a.node.handle_datagram(&datagram, from);
            } else if to == pair.b.addr {
                node_b2.handle_datagram(&datagram, from);
            }
        }
        pair.clock.advance(Duration::from_millis(10));
    }

    // The restart dropped the in-flight message.
    assert_eq!(stuck_rx.try_recv().unwrap(), SendOutcome::Disconnected);
    assert!(pair.peer_ab.is_connected());

    // New traffic flows to the restarted node.
    let received_b2 = Arc::new(Mutex::new(Vec::new()));
    let sink = received_b2.clone();
    peer_b2a.on_message(move |msg| sink.lock().push(msg.to_vec()));
    pair.peer_ab.send(b"fresh start".to_vec(), Priority::Normal).unwrap();
    for _ in 0..10 {
        pair.a.node.poll();
        node_b2.poll();
        let batch = pair.bus.take_all();
        for (from, to, datagram) in batch {
            if to == pair.a.addr {
                pair.a.node.handle_datagram(&datagram, from);
            } else if to == pair.b.addr {
                node_b2.handle_datagram(&datagram, from);
            }
        }
        pair.clock.advance(Duration::from_millis(10));
    }
    assert_eq!(*received_b2.lock(), vec![b"fresh start".to_vec()]);
}

#[test]
fn rekey_on_byte_volume_installs_fresh_tracker() {
    let cfg = LinkConfig {
        rekey_byte_limit: 1 << 20, // 1 MiB for the test
        ..LinkConfig::default()
    };
    let pair = build_pair(cfg);
    pair.connect();
    assert_eq!(pair.peer_ab.stats().handshakes_completed, 1);

    let chunk: Vec<u8> = (0..100 * 1024u32).map(|i| (i % 255) as u8).collect();
    for _ in 0..15 {
        pair.peer_ab.send(chunk.clone(), Priority::Bulk).unwrap();
    }

    for _ in 0..120 {
        pair.round(Duration::from_millis(50));
        if pair.received_b.lock().len() == 15 {
            break;
        }
    }

    let received = pair.received_b.lock();
    assert_eq!(received.len(), 15, "all 1.5 MiB delivered");
    assert!(received.iter().all(|m| *m == chunk));

    // More than one handshake completed: the byte-volume trigger forced
    // a rekey mid-stream.
    assert!(
        pair.peer_ab.stats().handshakes_completed >= 2,
        "rekey happened: {:?}",
        pair.peer_ab.stats()
    );
    assert!(pair.peer_ab.is_connected());
}

/// Transport that hands datagrams straight to the destination node, so
/// the spawned sender tasks drive everything with no test pump.
struct DirectTransport {
    local: SocketAddr,
    registry: Arc<Mutex<HashMap<SocketAddr, Arc<LinkNode>>>>,
}

impl Transport for DirectTransport {
    fn send(&self, datagram: &[u8], dest: SocketAddr) {
        let node = self.registry.lock().get(&dest).cloned();
        if let Some(node) = node {
            node.handle_datagram(datagram, self.local);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_sender_task_drives_echo() {
    let registry: Arc<Mutex<HashMap<SocketAddr, Arc<LinkNode>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let addr_a: SocketAddr = ADDR_A.parse().unwrap();
    let addr_b: SocketAddr = ADDR_B.parse().unwrap();
    let id_a = SigningIdentity::generate();
    let id_b = SigningIdentity::generate();
    let info_a = PeerInfo {
        public_key: id_a.public_bytes(),
        address: addr_a,
        role: PeerRole::Darknet,
    };
    let info_b = PeerInfo {
        public_key: id_b.public_bytes(),
        address: addr_b,
        role: PeerRole::Opennet,
    };

    let mut nodes = Vec::new();
    for (id, addr, dir_info) in [(id_a, addr_a, info_b.clone()), (id_b, addr_b, info_a.clone())] {
        let directory = Arc::new(TestDirectory::default());
        directory.insert(dir_info);
        let node = Arc::new(
            LinkNode::new(
                LinkConfig::default(),
                id,
                b"noderef".to_vec(),
                Arc::new(DirectTransport {
                    local: addr,
                    registry: registry.clone(),
                }),
                directory,
                Arc::new(wr_link::SystemClock::new()),
            )
            .unwrap(),
        );
        registry.lock().insert(addr, node.clone());
        nodes.push(node);
    }
    let peer_ab = nodes[0].register_peer(info_b);
    let peer_ba = nodes[1].register_peer(info_a);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    peer_ba.on_message(move |msg| sink.lock().push(msg.to_vec()));

    let mut tasks = nodes[0].start();
    tasks.extend(nodes[1].start());

    let rx = peer_ab
        .send(b"driven by the sender task".to_vec(), Priority::Normal)
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("acknowledged in time")
        .expect("completion delivered");
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(*received.lock(), vec![b"driven by the sender task".to_vec()]);

    nodes[0].shutdown();
    nodes[1].shutdown();
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_measures_round_trip() {
    let pair = Arc::new(build_pair(LinkConfig::default()));
    pair.connect();

    let driver = {
        let pair = pair.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                pair.round(Duration::from_millis(5));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let rtt = pair.peer_ab.ping().await;
    assert!(rtt.is_some(), "ping completed");
    driver.abort();

    // The empty ping message is link-internal: nothing reached the app.
    assert!(pair.received_b.lock().is_empty());
}

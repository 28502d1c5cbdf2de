//! Node glue: peer registry, datagram dispatch and the per-peer
//! maintenance pipeline.
//!
//! Each peer owns its handshake state, tracker trio and channel behind
//! one mutex; cross-peer state is limited to the DH context pool and
//! the responder guard inside the handshake engine. Locks are never
//! held across transport writes or upstream callbacks — everything to
//! send or deliver is collected first and flushed after release.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use wr_crypto::{DhContext, SigningIdentity};
use wr_proto::{peel, unframe_interior, PacketPayload, PACKET_TYPE_M1};

use crate::channel::ReliableChannel;
use crate::clock::Clock;
use crate::collaborators::{PeerDirectory, PeerId, PeerInfo, Transport};
use crate::config::LinkConfig;
use crate::error::{FailureReason, LinkError};
use crate::handshake::{Established, HandshakeEngine, HandshakeEvent, HandshakeState, PeerCrypto};
use crate::peer::Peer;
use crate::session::SessionState;
use crate::tracker::SentPacketRecord;

/// Upper bound on packets flushed for one peer in one poll pass.
const MAX_PACKETS_PER_POLL: usize = 256;

/// Boot-ID changes inside this window count towards the flap limit.
const BOOT_FLAP_WINDOW: Duration = Duration::from_secs(300);
const BOOT_FLAP_LIMIT: usize = 3;

pub(crate) type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub(crate) struct PeerState {
    pub hs: HandshakeState,
    pub session: SessionState,
    pub channel: ReliableChannel,
    pub connected: bool,
    pub peer_boot_id: Option<u64>,
    pub boot_changes: VecDeque<Duration>,
    pub decode_failures: u64,
}

pub struct PeerHandle {
    pub(crate) id: PeerId,
    pub(crate) info: PeerInfo,
    pub(crate) crypto: PeerCrypto,
    pub(crate) state: Mutex<PeerState>,
    pub(crate) on_message: Mutex<Option<MessageCallback>>,
}

/// Live statistics for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub connected: bool,
    pub handshakes_completed: u64,
    pub bytes_processed: u64,
    pub decode_failures: u64,
    pub used_local_buffer: usize,
    pub used_remote_buffer: usize,
}

pub(crate) struct NodeShared {
    pub(crate) cfg: Arc<LinkConfig>,
    pub(crate) identity: Arc<SigningIdentity>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) directory: Arc<dyn PeerDirectory>,
    pub(crate) engine: HandshakeEngine,
    pub(crate) peers: RwLock<HashMap<PeerId, Arc<PeerHandle>>>,
    pub(crate) by_addr: RwLock<HashMap<SocketAddr, PeerId>>,
    next_peer_id: AtomicU64,
    pub(crate) wake: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) heartbeat: AtomicU64,
    refill_in_flight: AtomicBool,
    pub(crate) fatal_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// The link-layer node: owns every peer's secure pipeline and mediates
/// between the datagram transport and the upstream message consumers.
pub struct LinkNode {
    pub(crate) shared: Arc<NodeShared>,
}

impl LinkNode {
    pub fn new(
        cfg: LinkConfig,
        identity: SigningIdentity,
        local_reference: Vec<u8>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LinkError> {
        cfg.validate()?;
        if local_reference.len() > cfg.max_peer_reference_len {
            return Err(LinkError::Config(
                "local peer reference exceeds max_peer_reference_len".into(),
            ));
        }
        let cfg = Arc::new(cfg);
        let identity = Arc::new(identity);
        let boot_id = OsRng.next_u64();
        let now = clock.monotonic();
        let engine = HandshakeEngine::new(
            identity.clone(),
            boot_id,
            local_reference,
            cfg.clone(),
            now,
        );
        let (shutdown, _) = watch::channel(false);
        info!(boot_id, "link node starting");
        Ok(Self {
            shared: Arc::new(NodeShared {
                cfg,
                identity,
                clock,
                transport,
                directory,
                engine,
                peers: RwLock::new(HashMap::new()),
                by_addr: RwLock::new(HashMap::new()),
                next_peer_id: AtomicU64::new(1),
                wake: Notify::new(),
                shutdown,
                heartbeat: AtomicU64::new(0),
                refill_in_flight: AtomicBool::new(false),
                fatal_hook: Mutex::new(None),
            }),
        })
    }

    pub fn boot_id(&self) -> u64 {
        self.shared.engine.boot_id()
    }

    /// Called by the watchdog when the sender task wedges; default is to
    /// log only.
    pub fn set_fatal_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.shared.fatal_hook.lock() = Some(hook);
    }

    /// Register a peer and get its facade.
    pub fn register_peer(&self, info: PeerInfo) -> Peer {
        let handle = self.shared.register(info);
        Peer::new(self.shared.clone(), handle)
    }

    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        let handle = self.shared.peers.read().get(&id).cloned()?;
        Some(Peer::new(self.shared.clone(), handle))
    }

    /// Feed one received datagram into the node. The transport owner
    /// calls this from its receive pump.
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        self.shared.handle_datagram(datagram, from);
    }

    /// One maintenance pass: handshake timers, rekey policy, loss
    /// timeouts and packet building. The spawned sender task calls this
    /// on every wake; tests may drive it directly.
    pub fn poll(&self) {
        self.shared.poll();
    }

    /// Spawn the packet-sender and watchdog tasks on the current tokio
    /// runtime.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            crate::sender::spawn_sender_loop(self.shared.clone()),
            crate::watchdog::spawn_watchdog(self.shared.clone()),
        ]
    }

    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.wake.notify_waiters();
    }
}

impl NodeShared {
    pub(crate) fn register(self: &Arc<Self>, info: PeerInfo) -> Arc<PeerHandle> {
        if let Some(existing) = self.by_addr.read().get(&info.address) {
            if let Some(handle) = self.peers.read().get(existing) {
                return handle.clone();
            }
        }
        let id = PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(PeerHandle {
            id,
            crypto: PeerCrypto::derive(&self.identity, &info),
            info,
            state: Mutex::new(PeerState {
                hs: HandshakeState::Idle,
                session: SessionState::new(),
                channel: ReliableChannel::new(self.cfg.clone()),
                connected: false,
                peer_boot_id: None,
                boot_changes: VecDeque::new(),
                decode_failures: 0,
            }),
            on_message: Mutex::new(None),
        });
        self.peers.write().insert(id, handle.clone());
        self.by_addr.write().insert(handle.info.address, id);
        debug!(
            %id,
            address = %handle.info.address,
            identity = %hex::encode(&handle.crypto.identity_hash[..8]),
            "peer registered"
        );
        handle
    }

    pub(crate) fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) {
        let handle = {
            let known = self.by_addr.read().get(&from).copied();
            match known {
                Some(id) => self.peers.read().get(&id).cloned(),
                None => self
                    .directory
                    .lookup_by_address(&from)
                    .map(|info| self.register(info)),
            }
        };
        let Some(handle) = handle else {
            trace!(%from, "datagram from unknown address dropped");
            return;
        };
        self.process_datagram(&handle, datagram);
    }

    fn process_datagram(self: &Arc<Self>, handle: &Arc<PeerHandle>, datagram: &[u8]) {
        let now = self.clock.monotonic();
        let mut outgoing: Vec<Vec<u8>> = Vec::new();
        let mut deliveries: Vec<Vec<u8>> = Vec::new();
        let mut connected_reference: Option<Vec<u8>> = None;
        let mut failure: Option<FailureReason> = None;

        {
            let mut st = handle.state.lock();

            // Session packets first: the watchlist probe is far cheaper
            // than an envelope peel.
            if let Some((seq, interior, lost)) = st.session.decrypt(datagram, now) {
                for record in lost {
                    st.channel.handle_timeout_record(record);
                }
                match unframe_interior(&interior).and_then(PacketPayload::parse) {
                    Ok(payload) => {
                        for ack in payload.acks {
                            if let Some(record) = st.session.take_acked(ack) {
                                st.channel.handle_ack_record(record, now);
                            }
                        }
                        let outcome = st.channel.handle_fragments(payload.fragments);
                        if outcome.all_buffered {
                            st.channel.queue_ack(seq);
                        }
                        deliveries = outcome.deliveries;
                    }
                    Err(err) => {
                        st.decode_failures += 1;
                        debug!(%err, "undecodable packet interior");
                    }
                }
            } else {
                match peel(&handle.crypto.setup_in, datagram) {
                    Ok(packet) => {
                        if packet.packet_type == PACKET_TYPE_M1
                            && !handle.info.role.accepts_unsolicited_handshake()
                        {
                            debug!(role = ?handle.info.role, "unsolicited handshake refused");
                        } else {
                            let wall = self.clock.unix_millis();
                            match self.engine.handle(
                                &handle.crypto,
                                &mut st.hs,
                                packet,
                                now,
                                wall,
                            ) {
                                HandshakeEvent::None => {}
                                HandshakeEvent::Send(reply) => outgoing.push(reply),
                                HandshakeEvent::Violation(reason) => failure = Some(reason),
                                HandshakeEvent::Established(est) => {
                                    self.install_established(
                                        &mut st,
                                        *est,
                                        now,
                                        &mut outgoing,
                                        &mut connected_reference,
                                        &mut failure,
                                    );
                                }
                            }
                        }
                    }
                    Err(_) => {
                        st.decode_failures += 1;
                        trace!("datagram matched no tracker and no envelope");
                    }
                }
            }

            if let Some(reason) = &failure {
                teardown(&mut st, reason);
            }
        }

        self.flush(handle, outgoing);
        if let Some(reference) = connected_reference {
            self.directory.on_connected(&handle.info, &reference);
        }
        if let Some(reason) = failure {
            self.directory.on_disconnected(&handle.info, &reason);
        }
        self.deliver(handle, deliveries);
        self.wake.notify_one();
    }

    fn install_established(
        self: &Arc<Self>,
        st: &mut PeerState,
        est: Established,
        now: Duration,
        outgoing: &mut Vec<Vec<u8>>,
        connected_reference: &mut Option<Vec<u8>>,
        failure: &mut Option<FailureReason>,
    ) {
        if let Some(reply) = est.reply {
            outgoing.push(reply);
        }

        if let Some(previous_boot) = st.peer_boot_id {
            if previous_boot != est.peer_boot_id {
                info!(
                    old = previous_boot,
                    new = est.peer_boot_id,
                    "peer restarted, flushing retained state"
                );
                let _ = st.session.reset();
                st.channel.disconnect();
                st.connected = false;

                st.boot_changes.push_back(now);
                while matches!(st.boot_changes.front(),
                    Some(&t) if now.saturating_sub(t) > BOOT_FLAP_WINDOW)
                {
                    st.boot_changes.pop_front();
                }
                if st.boot_changes.len() > BOOT_FLAP_LIMIT {
                    *failure = Some(FailureReason::BootIdFlapLoop);
                    return;
                }
            }
        }
        st.peer_boot_id = Some(est.peer_boot_id);

        let was_connected = st.connected;
        for record in st.session.install(est.keys, est.initiator, now) {
            st.channel.handle_timeout_record(record);
        }
        st.connected = true;
        if !was_connected {
            *connected_reference = Some(est.peer_reference);
        }
    }

    pub(crate) fn poll(self: &Arc<Self>) {
        let now = self.clock.monotonic();
        self.engine.maintain(now);
        self.maybe_refill_pool(now);

        let handles: Vec<Arc<PeerHandle>> = self.peers.read().values().cloned().collect();
        for handle in handles {
            let mut outgoing: Vec<Vec<u8>> = Vec::new();
            let mut failure: Option<FailureReason> = None;
            {
                let mut st = handle.state.lock();

                if let Some(retransmit) = self.engine.poll(&mut st.hs, now) {
                    outgoing.push(retransmit);
                }

                // Connect on demand: queued traffic wants a session.
                if !st.connected && st.hs.is_idle() && st.channel.has_work() {
                    outgoing.push(self.engine.initiate(&handle.crypto, &mut st.hs, now));
                }

                if st.connected {
                    if st.session.rekey_needed(now, &self.cfg) && st.hs.is_idle() {
                        info!("rekey handshake starting");
                        outgoing.push(self.engine.initiate(&handle.crypto, &mut st.hs, now));
                    }
                    if st.session.rekey_overrun(now, &self.cfg) {
                        failure = Some(FailureReason::RekeyOverrun);
                    }
                }

                for record in st.session.expire_previous(now, self.cfg.handshake_timeout) {
                    st.channel.handle_timeout_record(record);
                }

                let cutoff = now.saturating_sub(st.channel.loss_timeout());
                for record in st.session.take_timed_out(cutoff) {
                    st.channel.handle_timeout_record(record);
                }

                if failure.is_none() && st.channel.window_stalled(now) {
                    failure = Some(FailureReason::MessageWindowStalled);
                }

                if failure.is_none() {
                    let max_records = self.cfg.max_records_len();
                    for _ in 0..MAX_PACKETS_PER_POLL {
                        if !st.session.can_send() {
                            break;
                        }
                        let Some(built) = st.channel.build_payload(max_records, now) else {
                            break;
                        };
                        match st.session.encrypt_packet(&built.bytes, &self.cfg) {
                            Some((wire, seq)) => {
                                st.session.record_sent(SentPacketRecord {
                                    seq,
                                    sent_at: now,
                                    fragments: built.fragments,
                                });
                                outgoing.push(wire);
                            }
                            None => {
                                // Tracker went away mid-build; recycle the
                                // consumed ranges as if the packet was lost.
                                st.channel.handle_timeout_record(SentPacketRecord {
                                    seq: 0,
                                    sent_at: now,
                                    fragments: built.fragments,
                                });
                                break;
                            }
                        }
                    }
                }

                if let Some(reason) = &failure {
                    teardown(&mut st, reason);
                }
            }
            self.flush(&handle, outgoing);
            if let Some(reason) = failure {
                warn!(peer = %handle.id, %reason, "peer failed");
                self.directory.on_disconnected(&handle.info, &reason);
            }
        }
    }

    /// Keep the DH pool stocked; generation runs on a blocking worker
    /// when a runtime is present.
    fn maybe_refill_pool(self: &Arc<Self>, now: Duration) {
        if !self.engine.pool.needs_refill(now) {
            return;
        }
        if self
            .refill_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let this = self.clone();
                rt.spawn_blocking(move || {
                    let ctx = DhContext::generate(&this.identity);
                    this.engine.pool.push(ctx, this.clock.monotonic());
                    this.refill_in_flight.store(false, Ordering::Release);
                    this.wake.notify_one();
                });
            }
            Err(_) => {
                let ctx = DhContext::generate(&self.identity);
                self.engine.pool.push(ctx, now);
                self.refill_in_flight.store(false, Ordering::Release);
            }
        }
    }

    pub(crate) fn flush(&self, handle: &Arc<PeerHandle>, outgoing: Vec<Vec<u8>>) {
        for datagram in outgoing {
            self.transport.send(&datagram, handle.crypto.address);
        }
    }

    fn deliver(&self, handle: &Arc<PeerHandle>, deliveries: Vec<Vec<u8>>) {
        if deliveries.is_empty() {
            return;
        }
        let callback = handle.on_message.lock().clone();
        for message in deliveries {
            if message.is_empty() {
                // Link-internal (ping) message; nothing for the app.
                continue;
            }
            match callback.as_deref() {
                Some(cb) => cb(&message),
                None => debug!(peer = %handle.id, "message dropped: no upstream consumer"),
            }
        }
    }

    pub(crate) fn stats(&self, handle: &Arc<PeerHandle>) -> PeerStats {
        let st = handle.state.lock();
        PeerStats {
            connected: st.connected,
            handshakes_completed: st.session.generations(),
            bytes_processed: st.session.bytes_processed(),
            decode_failures: st.decode_failures,
            used_local_buffer: st.channel.used_local_buffer(),
            used_remote_buffer: st.channel.used_remote_buffer(),
        }
    }
}

pub(crate) fn teardown(st: &mut PeerState, reason: &FailureReason) {
    debug!(%reason, "tearing peer session down");
    st.channel.disconnect();
    let _ = st.session.reset();
    st.hs = HandshakeState::Idle;
    st.connected = false;
}

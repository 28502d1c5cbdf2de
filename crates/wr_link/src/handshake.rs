//! JFK-style four-message handshake.
//!
//! Message flow (every datagram wrapped by the outer envelope):
//!
//! ```text
//! M1  I → R   nonce_i ∥ g^i
//! M2  R → I   nonce_i ∥ nonce_r ∥ g^r ∥ sig_r(g^r) ∥ authenticator
//! M3  I → R   nonce_i ∥ nonce_r ∥ g^i ∥ g^r ∥ authenticator
//!             ∥ HMAC_Ka("I" ∥ ct) ∥ iv ∥ ct
//! M4  R → I   HMAC_Ka("R" ∥ ct) ∥ iv ∥ ct
//! ```
//!
//! with `ct = E_Ke(sig ∥ boot_id ∥ timestamp ∥ peer_reference)` and
//! `(K_s, K_e, K_a) = HMAC(g^ir, nonce_i ∥ nonce_r ∥ "0"/"1"/"2")`.
//!
//! DoS posture: the responder allocates nothing per peer between M1 and
//! M3 — `nonce_r` is bound into the authenticator instead of stored, the
//! exponential and its signature come from the bounded context pool, and
//! a replayed M3 is answered from the authenticator cache with the
//! byte-identical sealed M4, without recomputing anything.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, trace, warn};

use wr_crypto::{
    hmac_sha256, hmac_verify, identity_hash_of, jfk_keys, sha256, validate_exponential, xor32,
    BlockCipher, CfbStream, DhContext, JfkKeys, SigningIdentity, BLOCK_LEN, EXPONENTIAL_LEN,
    NONCE_LEN, SIGNATURE_LEN,
};
use wr_proto::{
    seal, HandshakePacket, PACKET_TYPE_M1, PACKET_TYPE_M2, PACKET_TYPE_M3, PACKET_TYPE_M4,
};

use crate::collaborators::PeerInfo;
use crate::config::LinkConfig;
use crate::error::FailureReason;
use crate::tracker::SessionKeys;

const AUTH_LEN: usize = 32;
const MAC_LEN: usize = 32;

const M1_LEN: usize = NONCE_LEN + EXPONENTIAL_LEN;
const M2_LEN: usize = 2 * NONCE_LEN + EXPONENTIAL_LEN + SIGNATURE_LEN + AUTH_LEN;
const M3_FIXED: usize = 2 * NONCE_LEN + 2 * EXPONENTIAL_LEN + AUTH_LEN + MAC_LEN + BLOCK_LEN;
const M4_FIXED: usize = MAC_LEN + BLOCK_LEN;
/// Minimum ciphertext: a signature plus boot id and timestamp.
const MIN_CT: usize = SIGNATURE_LEN + 16;

// ── Per-peer crypto context ──────────────────────────────────────────────────

/// Immutable per-peer crypto material derived once at registration.
#[derive(Clone)]
pub struct PeerCrypto {
    pub public_key: [u8; 32],
    pub identity_hash: [u8; 32],
    /// Keys for the outer envelope: ours to seal with, theirs to peel.
    pub setup_out: [u8; 32],
    pub setup_in: [u8; 32],
    pub address: SocketAddr,
}

impl PeerCrypto {
    pub fn derive(local: &SigningIdentity, info: &PeerInfo) -> Self {
        let local_hash = local.identity_hash();
        let local_hash2 = sha256(&[&local_hash]);
        let peer_hash = identity_hash_of(&info.public_key);
        let peer_hash2 = sha256(&[&peer_hash]);
        Self {
            public_key: info.public_key,
            identity_hash: peer_hash,
            setup_out: xor32(&local_hash2, &peer_hash),
            setup_in: xor32(&local_hash, &peer_hash2),
            address: info.address,
        }
    }
}

// ── Per-peer handshake state ─────────────────────────────────────────────────

pub enum HandshakeState {
    Idle,
    SentM1 {
        nonce_i: [u8; NONCE_LEN],
        ctx: Arc<DhContext>,
        started_at: Duration,
    },
    AwaitM4 {
        nonce_i: [u8; NONCE_LEN],
        nonce_r: [u8; NONCE_LEN],
        exp_i: [u8; EXPONENTIAL_LEN],
        exp_r: [u8; EXPONENTIAL_LEN],
        jfk: JfkKeys,
        /// The sealed M3 datagram, kept for the single retransmit.
        m3: Vec<u8>,
        sent_m3_at: Duration,
        retransmitted: bool,
        started_at: Duration,
    },
}

impl HandshakeState {
    pub fn is_idle(&self) -> bool {
        matches!(self, HandshakeState::Idle)
    }

    pub fn in_progress(&self) -> bool {
        !self.is_idle()
    }
}

// ── Engine results ───────────────────────────────────────────────────────────

/// Output of a completed handshake.
pub struct Established {
    pub keys: SessionKeys,
    pub initiator: bool,
    pub peer_boot_id: u64,
    pub peer_reference: Vec<u8>,
    /// The responder's M4, to be transmitted alongside installing.
    pub reply: Option<Vec<u8>>,
}

pub enum HandshakeEvent {
    /// Nothing to do (dropped, replay-answered-inline, not for us).
    None,
    /// Transmit this datagram.
    Send(Vec<u8>),
    Established(Box<Established>),
    /// Protocol violation; abort and surface to peer management.
    Violation(FailureReason),
}

// ── DH context pool ──────────────────────────────────────────────────────────

/// Bounded FIFO of precomputed DH contexts, shared across peers.
pub struct DhContextPool {
    inner: Mutex<VecDeque<PoolEntry>>,
    capacity: usize,
    lifetime: Duration,
}

struct PoolEntry {
    ctx: Arc<DhContext>,
    created_at: Duration,
}

impl DhContextPool {
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            lifetime,
        }
    }

    /// Newest reusable context, generating one inline only when the pool
    /// is dry (the refill worker normally keeps it stocked).
    pub fn obtain(&self, identity: &SigningIdentity, now: Duration) -> Arc<DhContext> {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner
                .iter()
                .rev()
                .find(|e| now.saturating_sub(e.created_at) < self.lifetime)
            {
                return entry.ctx.clone();
            }
        }
        let ctx = Arc::new(DhContext::generate(identity));
        self.push_arc(ctx.clone(), now);
        ctx
    }

    /// Find the context matching a `g^r` echoed back in M3. Retired
    /// entries still match until pruned.
    pub fn find(&self, public: &[u8; EXPONENTIAL_LEN]) -> Option<Arc<DhContext>> {
        self.inner
            .lock()
            .iter()
            .find(|e| e.ctx.public() == public)
            .map(|e| e.ctx.clone())
    }

    pub fn push(&self, ctx: DhContext, now: Duration) {
        self.push_arc(Arc::new(ctx), now);
    }

    fn push_arc(&self, ctx: Arc<DhContext>, now: Duration) {
        let mut inner = self.inner.lock();
        while inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(PoolEntry {
            ctx,
            created_at: now,
        });
    }

    /// True when no context is fresh enough to hand out.
    pub fn needs_refill(&self, now: Duration) -> bool {
        !self
            .inner
            .lock()
            .iter()
            .any(|e| now.saturating_sub(e.created_at) < self.lifetime)
    }

    /// Drop contexts too old even for M3 matching (reuse lifetime plus a
    /// handshake round).
    pub fn prune(&self, now: Duration, handshake_timeout: Duration) {
        let retention = self.lifetime + handshake_timeout;
        self.inner
            .lock()
            .retain(|e| now.saturating_sub(e.created_at) < retention);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Transient key + authenticator cache ──────────────────────────────────────

/// Responder-side anti-replay state. The transient key and the cache it
/// keys rotate together under one lock.
pub struct ResponderGuard {
    capacity: usize,
    min_interval: Duration,
    inner: Mutex<GuardInner>,
}

struct GuardInner {
    key: [u8; 32],
    rotated_at: Duration,
    cache: HashMap<[u8; AUTH_LEN], Vec<u8>>,
    rotations: u64,
}

impl ResponderGuard {
    pub fn new(capacity: usize, min_interval: Duration, now: Duration) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self {
            capacity,
            min_interval,
            inner: Mutex::new(GuardInner {
                key,
                rotated_at: now,
                cache: HashMap::new(),
                rotations: 0,
            }),
        }
    }

    fn compute(
        &self,
        exp_r: &[u8],
        exp_i: &[u8],
        nonce_r: &[u8],
        nonce_i: &[u8],
        addr: &SocketAddr,
    ) -> [u8; AUTH_LEN] {
        let addr = addr_bytes(addr);
        let key = self.inner.lock().key;
        hmac_sha256(&key, &[exp_r, exp_i, nonce_r, nonce_i, &addr])
    }

    fn matches(
        &self,
        auth: &[u8],
        exp_r: &[u8],
        exp_i: &[u8],
        nonce_r: &[u8],
        nonce_i: &[u8],
        addr: &SocketAddr,
    ) -> bool {
        let addr = addr_bytes(addr);
        let key = self.inner.lock().key;
        hmac_verify(&key, &[exp_r, exp_i, nonce_r, nonce_i, &addr], auth).is_ok()
    }

    fn cached(&self, auth: &[u8; AUTH_LEN]) -> Option<Vec<u8>> {
        self.inner.lock().cache.get(auth).cloned()
    }

    /// Cache a computed M4 under its authenticator. Hitting capacity
    /// rotates the transient key instead, which invalidates every
    /// outstanding authenticator at once.
    fn store(&self, auth: [u8; AUTH_LEN], reply: Vec<u8>, now: Duration) {
        let mut inner = self.inner.lock();
        if inner.cache.len() >= self.capacity {
            Self::rotate(&mut inner, now);
            return;
        }
        inner.cache.insert(auth, reply);
    }

    /// Periodic rotation; never more often than `min_interval` from here
    /// (capacity pressure can force an earlier one via `store`).
    pub fn maintain(&self, now: Duration) {
        let mut inner = self.inner.lock();
        if now.saturating_sub(inner.rotated_at) >= self.min_interval {
            Self::rotate(&mut inner, now);
        }
    }

    fn rotate(inner: &mut GuardInner, now: Duration) {
        OsRng.fill_bytes(&mut inner.key);
        inner.cache.clear();
        inner.rotated_at = now;
        inner.rotations += 1;
        debug!("transient key rotated, authenticator cache flushed");
    }

    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn rotations(&self) -> u64 {
        self.inner.lock().rotations
    }
}

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct HandshakeEngine {
    identity: Arc<SigningIdentity>,
    local_hash: [u8; 32],
    boot_id: u64,
    local_reference: Vec<u8>,
    cfg: Arc<LinkConfig>,
    pub(crate) pool: DhContextPool,
    guard: ResponderGuard,
}

impl HandshakeEngine {
    pub fn new(
        identity: Arc<SigningIdentity>,
        boot_id: u64,
        local_reference: Vec<u8>,
        cfg: Arc<LinkConfig>,
        now: Duration,
    ) -> Self {
        let local_hash = identity.identity_hash();
        Self {
            pool: DhContextPool::new(cfg.dh_pool_capacity, cfg.dh_context_lifetime),
            guard: ResponderGuard::new(
                cfg.authenticator_cache_capacity,
                cfg.transient_key_interval,
                now,
            ),
            identity,
            local_hash,
            boot_id,
            local_reference,
            cfg,
        }
    }

    pub fn boot_id(&self) -> u64 {
        self.boot_id
    }

    /// Start a handshake towards `peer`; returns the sealed M1.
    pub fn initiate(
        &self,
        peer: &PeerCrypto,
        state: &mut HandshakeState,
        now: Duration,
    ) -> Vec<u8> {
        let ctx = self.pool.obtain(&self.identity, now);
        let mut nonce_i = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_i);

        let mut body = Vec::with_capacity(M1_LEN);
        body.extend_from_slice(&nonce_i);
        body.extend_from_slice(ctx.public());

        *state = HandshakeState::SentM1 {
            nonce_i,
            ctx,
            started_at: now,
        };
        trace!("handshake initiated");
        seal(&peer.setup_out, PACKET_TYPE_M1, &body)
    }

    /// Process one peeled handshake packet for `peer`.
    pub fn handle(
        &self,
        peer: &PeerCrypto,
        state: &mut HandshakeState,
        packet: HandshakePacket,
        now: Duration,
        wall_ms: i64,
    ) -> HandshakeEvent {
        match packet.packet_type {
            PACKET_TYPE_M1 => self.handle_m1(peer, &packet.body, now),
            PACKET_TYPE_M2 => self.handle_m2(peer, state, &packet.body, now, wall_ms),
            PACKET_TYPE_M3 => self.handle_m3(peer, &packet.body, now, wall_ms),
            PACKET_TYPE_M4 => self.handle_m4(peer, state, &packet.body, wall_ms),
            _ => HandshakeEvent::None,
        }
    }

    /// Timeout and retransmit bookkeeping; returns a datagram to resend
    /// when the single M3 retransmit is due.
    pub fn poll(&self, state: &mut HandshakeState, now: Duration) -> Option<Vec<u8>> {
        match state {
            HandshakeState::Idle => None,
            HandshakeState::SentM1 { started_at, .. } => {
                if now.saturating_sub(*started_at) >= self.cfg.handshake_timeout {
                    debug!("handshake timed out awaiting M2");
                    *state = HandshakeState::Idle;
                }
                None
            }
            HandshakeState::AwaitM4 {
                started_at,
                sent_m3_at,
                retransmitted,
                m3,
                ..
            } => {
                if now.saturating_sub(*started_at) >= self.cfg.handshake_timeout {
                    debug!("handshake timed out awaiting M4");
                    *state = HandshakeState::Idle;
                    return None;
                }
                if !*retransmitted
                    && now.saturating_sub(*sent_m3_at) >= self.cfg.m3_retransmit_after
                {
                    *retransmitted = true;
                    debug!("retransmitting M3");
                    return Some(m3.clone());
                }
                None
            }
        }
    }

    /// Shared-state upkeep: transient-key rotation and pool pruning.
    pub fn maintain(&self, now: Duration) {
        self.guard.maintain(now);
        self.pool.prune(now, self.cfg.handshake_timeout);
    }

    // ── Responder: M1 ───────────────────────────────────────────────────

    /// Stateless: everything the responder will need later is bound into
    /// the authenticator the initiator must echo.
    fn handle_m1(&self, peer: &PeerCrypto, body: &[u8], now: Duration) -> HandshakeEvent {
        if body.len() != M1_LEN {
            return HandshakeEvent::None;
        }
        let nonce_i = &body[..NONCE_LEN];
        let exp_i = match validate_exponential(&body[NONCE_LEN..]) {
            Ok(e) => e,
            Err(_) => {
                trace!("M1 with invalid exponential dropped");
                return HandshakeEvent::None;
            }
        };

        let ctx = self.pool.obtain(&self.identity, now);
        let mut nonce_r = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_r);

        let auth = self
            .guard
            .compute(ctx.public(), &exp_i, &nonce_r, nonce_i, &peer.address);

        let mut body_out = Vec::with_capacity(M2_LEN);
        body_out.extend_from_slice(nonce_i);
        body_out.extend_from_slice(&nonce_r);
        body_out.extend_from_slice(ctx.public());
        body_out.extend_from_slice(ctx.signature());
        body_out.extend_from_slice(&auth);

        HandshakeEvent::Send(seal(&peer.setup_out, PACKET_TYPE_M2, &body_out))
    }

    // ── Initiator: M2 ───────────────────────────────────────────────────

    fn handle_m2(
        &self,
        peer: &PeerCrypto,
        state: &mut HandshakeState,
        body: &[u8],
        now: Duration,
        wall_ms: i64,
    ) -> HandshakeEvent {
        let taken = std::mem::replace(state, HandshakeState::Idle);
        let (nonce_i, ctx, started_at) = match taken {
            HandshakeState::SentM1 {
                nonce_i,
                ctx,
                started_at,
            } => (nonce_i, ctx, started_at),
            other => {
                // Not expecting an M2; leave whatever was there.
                *state = other;
                return HandshakeEvent::None;
            }
        };

        if body.len() != M2_LEN || body[..NONCE_LEN] != nonce_i {
            // Stale or malformed; keep waiting for the real one.
            *state = HandshakeState::SentM1 {
                nonce_i,
                ctx,
                started_at,
            };
            return HandshakeEvent::None;
        }

        let mut cursor = NONCE_LEN;
        let nonce_r: [u8; NONCE_LEN] = body[cursor..cursor + NONCE_LEN]
            .try_into()
            .expect("fixed split");
        cursor += NONCE_LEN;
        let exp_r = match validate_exponential(&body[cursor..cursor + EXPONENTIAL_LEN]) {
            Ok(e) => e,
            Err(_) => return HandshakeEvent::None,
        };
        cursor += EXPONENTIAL_LEN;
        let sig_r = &body[cursor..cursor + SIGNATURE_LEN];
        cursor += SIGNATURE_LEN;
        let auth = &body[cursor..cursor + AUTH_LEN];

        if wr_crypto::dh::verify_exponential_signature(&peer.public_key, &exp_r, sig_r).is_err() {
            warn!("M2 exponential signature mismatch");
            return HandshakeEvent::Violation(FailureReason::SignatureMismatch);
        }

        let shared = match ctx.shared_secret(&exp_r) {
            Ok(s) => s,
            Err(_) => {
                debug!("M2 exponential yields degenerate shared secret");
                return HandshakeEvent::None;
            }
        };
        let jfk = jfk_keys(&shared, &nonce_i, &nonce_r);

        // Signed payload: who we are at this boot, when, and our
        // compressed reference.
        let payload = self.signed_payload(wall_ms);
        let exp_i = *ctx.public();
        let sig_i = self.identity.sign(&[
            &nonce_i,
            &nonce_r,
            &exp_i,
            &exp_r,
            &peer.identity_hash,
            &payload,
        ]);

        let (iv, ct) = encrypt_handshake_payload(&jfk.k_e, &sig_i, &payload);
        let mac = hmac_sha256(&jfk.k_a, &[b"I", &ct]);

        let mut body_out = Vec::with_capacity(M3_FIXED + ct.len());
        body_out.extend_from_slice(&nonce_i);
        body_out.extend_from_slice(&nonce_r);
        body_out.extend_from_slice(&exp_i);
        body_out.extend_from_slice(&exp_r);
        body_out.extend_from_slice(auth);
        body_out.extend_from_slice(&mac);
        body_out.extend_from_slice(&iv);
        body_out.extend_from_slice(&ct);

        let sealed = seal(&peer.setup_out, PACKET_TYPE_M3, &body_out);
        *state = HandshakeState::AwaitM4 {
            nonce_i,
            nonce_r,
            exp_i,
            exp_r,
            jfk,
            m3: sealed.clone(),
            sent_m3_at: now,
            retransmitted: false,
            started_at,
        };
        HandshakeEvent::Send(sealed)
    }

    // ── Responder: M3 ───────────────────────────────────────────────────

    fn handle_m3(
        &self,
        peer: &PeerCrypto,
        body: &[u8],
        now: Duration,
        wall_ms: i64,
    ) -> HandshakeEvent {
        if body.len() < M3_FIXED + MIN_CT {
            return HandshakeEvent::None;
        }
        let mut cursor = 0;
        let nonce_i = &body[cursor..cursor + NONCE_LEN];
        cursor += NONCE_LEN;
        let nonce_r = &body[cursor..cursor + NONCE_LEN];
        cursor += NONCE_LEN;
        let exp_i_raw = &body[cursor..cursor + EXPONENTIAL_LEN];
        cursor += EXPONENTIAL_LEN;
        let exp_r_raw: [u8; EXPONENTIAL_LEN] = body[cursor..cursor + EXPONENTIAL_LEN]
            .try_into()
            .expect("fixed split");
        cursor += EXPONENTIAL_LEN;
        let auth: [u8; AUTH_LEN] = body[cursor..cursor + AUTH_LEN]
            .try_into()
            .expect("fixed split");
        cursor += AUTH_LEN;
        let mac = &body[cursor..cursor + MAC_LEN];
        cursor += MAC_LEN;
        let iv: [u8; BLOCK_LEN] = body[cursor..cursor + BLOCK_LEN]
            .try_into()
            .expect("fixed split");
        cursor += BLOCK_LEN;
        let ct = &body[cursor..];

        // 1. Only authenticators we minted (under the current transient
        //    key, for this address) get any further work.
        if !self
            .guard
            .matches(&auth, &exp_r_raw, exp_i_raw, nonce_r, nonce_i, &peer.address)
        {
            trace!("M3 authenticator mismatch (stale transient key?)");
            return HandshakeEvent::None;
        }

        // 2. Replay: answer from the cache, bit-for-bit.
        if let Some(cached) = self.guard.cached(&auth) {
            debug!("M3 replay answered from authenticator cache");
            return HandshakeEvent::Send(cached);
        }

        // 3. Recover our DH context for g^r.
        let ctx = match self.pool.find(&exp_r_raw) {
            Some(c) => c,
            None => {
                debug!("M3 references an expired DH context");
                return HandshakeEvent::None;
            }
        };

        let exp_i = match validate_exponential(exp_i_raw) {
            Ok(e) => e,
            Err(_) => return HandshakeEvent::None,
        };
        let shared = match ctx.shared_secret(&exp_i) {
            Ok(s) => s,
            Err(_) => return HandshakeEvent::None,
        };
        let nonce_i_arr: [u8; NONCE_LEN] = nonce_i.try_into().expect("fixed split");
        let nonce_r_arr: [u8; NONCE_LEN] = nonce_r.try_into().expect("fixed split");
        let jfk = jfk_keys(&shared, &nonce_i_arr, &nonce_r_arr);

        // 4. Authenticate and open the payload, direction-bound.
        if hmac_verify(&jfk.k_a, &[b"I", ct], mac).is_err() {
            trace!("M3 payload MAC mismatch");
            return HandshakeEvent::None;
        }
        let plain = decrypt_handshake_payload(&jfk.k_e, &iv, ct);
        let (sig_i, payload) = plain.split_at(SIGNATURE_LEN);

        let parsed = match self.check_payload(payload, wall_ms) {
            Ok(p) => p,
            Err(reason) => return HandshakeEvent::Violation(reason),
        };

        if wr_crypto::verify(
            &peer.public_key,
            &[
                nonce_i,
                nonce_r,
                &exp_i,
                &exp_r_raw,
                &self.local_hash,
                payload,
            ],
            sig_i,
        )
        .is_err()
        {
            warn!("M3 signature mismatch");
            return HandshakeEvent::Violation(FailureReason::SignatureMismatch);
        }

        // 5. Build, cache and send M4; install the tracker unverified.
        let payload_out = self.signed_payload(wall_ms);
        let sig_r = self.identity.sign(&[
            nonce_i,
            nonce_r,
            &exp_i,
            &exp_r_raw,
            &peer.identity_hash,
            &payload_out,
        ]);
        let (iv_out, ct_out) = encrypt_handshake_payload(&jfk.k_e, &sig_r, &payload_out);
        let mac_out = hmac_sha256(&jfk.k_a, &[b"R", &ct_out]);

        let mut body_out = Vec::with_capacity(M4_FIXED + ct_out.len());
        body_out.extend_from_slice(&mac_out);
        body_out.extend_from_slice(&iv_out);
        body_out.extend_from_slice(&ct_out);
        let sealed = seal(&peer.setup_out, PACKET_TYPE_M4, &body_out);
        self.guard.store(auth, sealed.clone(), now);

        let keys = match SessionKeys::from_master(&jfk.k_s, false) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "tracker key derivation failed");
                return HandshakeEvent::None;
            }
        };
        info!("handshake complete (responder)");
        HandshakeEvent::Established(Box::new(Established {
            keys,
            initiator: false,
            peer_boot_id: parsed.boot_id,
            peer_reference: parsed.reference,
            reply: Some(sealed),
        }))
    }

    // ── Initiator: M4 ───────────────────────────────────────────────────

    fn handle_m4(
        &self,
        peer: &PeerCrypto,
        state: &mut HandshakeState,
        body: &[u8],
        wall_ms: i64,
    ) -> HandshakeEvent {
        let taken = std::mem::replace(state, HandshakeState::Idle);
        let (nonce_i, nonce_r, exp_i, exp_r, jfk) = match taken {
            HandshakeState::AwaitM4 {
                nonce_i,
                nonce_r,
                exp_i,
                exp_r,
                jfk,
                ..
            } => (nonce_i, nonce_r, exp_i, exp_r, jfk),
            other => {
                *state = other;
                return HandshakeEvent::None;
            }
        };

        if body.len() < M4_FIXED + MIN_CT {
            return HandshakeEvent::None;
        }
        let mac = &body[..MAC_LEN];
        let iv: [u8; BLOCK_LEN] = body[MAC_LEN..MAC_LEN + BLOCK_LEN]
            .try_into()
            .expect("fixed split");
        let ct = &body[M4_FIXED..];

        if hmac_verify(&jfk.k_a, &[b"R", ct], mac).is_err() {
            trace!("M4 payload MAC mismatch");
            return HandshakeEvent::None;
        }
        let plain = decrypt_handshake_payload(&jfk.k_e, &iv, ct);
        let (sig_r, payload) = plain.split_at(SIGNATURE_LEN);

        let parsed = match self.check_payload(payload, wall_ms) {
            Ok(p) => p,
            Err(reason) => return HandshakeEvent::Violation(reason),
        };

        if wr_crypto::verify(
            &peer.public_key,
            &[
                &nonce_i,
                &nonce_r,
                &exp_i,
                &exp_r,
                &self.local_hash,
                payload,
            ],
            sig_r,
        )
        .is_err()
        {
            warn!("M4 signature mismatch");
            return HandshakeEvent::Violation(FailureReason::SignatureMismatch);
        }

        let keys = match SessionKeys::from_master(&jfk.k_s, true) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "tracker key derivation failed");
                return HandshakeEvent::None;
            }
        };
        info!("handshake complete (initiator)");
        HandshakeEvent::Established(Box::new(Established {
            keys,
            initiator: true,
            peer_boot_id: parsed.boot_id,
            peer_reference: parsed.reference,
            reply: None,
        }))
    }

    // ── Payload helpers ─────────────────────────────────────────────────

    fn signed_payload(&self, wall_ms: i64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(16 + self.local_reference.len());
        payload.extend_from_slice(&self.boot_id.to_be_bytes());
        payload.extend_from_slice(&wall_ms.to_be_bytes());
        payload.extend_from_slice(&self.local_reference);
        payload
    }

    fn check_payload(&self, payload: &[u8], wall_ms: i64) -> Result<ParsedPayload, FailureReason> {
        // The caller guaranteed at least boot id + timestamp.
        let boot_id = u64::from_be_bytes(payload[..8].try_into().expect("fixed split"));
        let sent_ms = i64::from_be_bytes(payload[8..16].try_into().expect("fixed split"));
        let reference = payload[16..].to_vec();

        if reference.len() > self.cfg.max_peer_reference_len {
            return Err(FailureReason::OversizedReference);
        }
        let skew = wall_ms.abs_diff(sent_ms);
        if skew > self.cfg.max_clock_skew.as_millis() as u64 {
            return Err(FailureReason::ClockSkew);
        }
        Ok(ParsedPayload { boot_id, reference })
    }
}

struct ParsedPayload {
    boot_id: u64,
    reference: Vec<u8>,
}

fn encrypt_handshake_payload(
    k_e: &[u8; 32],
    sig: &[u8; SIGNATURE_LEN],
    payload: &[u8],
) -> ([u8; BLOCK_LEN], Vec<u8>) {
    let mut iv = [0u8; BLOCK_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut ct = Vec::with_capacity(SIGNATURE_LEN + payload.len());
    ct.extend_from_slice(sig);
    ct.extend_from_slice(payload);
    let cipher = BlockCipher::new(k_e);
    CfbStream::new(&cipher, &iv).encrypt(&mut ct);
    (iv, ct)
}

fn decrypt_handshake_payload(k_e: &[u8; 32], iv: &[u8; BLOCK_LEN], ct: &[u8]) -> Vec<u8> {
    let mut plain = ct.to_vec();
    let cipher = BlockCipher::new(k_e);
    CfbStream::new(&cipher, iv).decrypt(&mut plain);
    plain
}

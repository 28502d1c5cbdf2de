//! Session key tracker.
//!
//! One tracker holds the cipher/MAC material derived from one completed
//! handshake plus both directions' sequence-number state. Outgoing
//! packets are `HMAC(ct)[0..4] ∥ CFB(out_key, IV_seq, seq_be32 ∥
//! interior)` with `IV_seq = AES(iv_key, iv_nonce ∥ seq_be32)`; incoming
//! packets are recognised in O(window) by a 1024-entry watchlist of
//! pre-computed leading ciphertext words, then fully authenticated and
//! decrypted.
//!
//! Lifecycle: Unverified → Current (first successful decrypt) →
//! Previous (displaced) → Deprecated. At most one tracker per slot per
//! peer; the session layer owns the trio.

use std::collections::HashMap;
use std::time::Duration;

use wr_crypto::{
    hmac_sha256, hmac_verify_truncated, tracker_keys, BlockCipher, CryptoError, BLOCK_LEN,
    IV_NONCE_LEN, PACKET_MAC_LEN,
};
use wr_proto::serial;
use wr_proto::{SEQ_BITS, SEQ_MOD};

pub const WATCHLIST_SIZE: usize = 1024;
const WATCHLIST_HALF: u32 = (WATCHLIST_SIZE / 2) as u32;

/// Directional key material for one tracker.
pub struct SessionKeys {
    out_block: BlockCipher,
    in_block: BlockCipher,
    iv_block: BlockCipher,
    mac_key: [u8; 32],
    iv_nonce: [u8; IV_NONCE_LEN],
}

impl SessionKeys {
    /// Expand the session master into directional keys. `initiator`
    /// selects which derived key is ours to send on.
    pub fn from_master(k_s: &[u8; 32], initiator: bool) -> Result<Self, CryptoError> {
        let schedule = tracker_keys(k_s)?;
        let (out_key, in_key) = if initiator {
            (schedule.init_to_resp, schedule.resp_to_init)
        } else {
            (schedule.resp_to_init, schedule.init_to_resp)
        };
        Ok(Self {
            out_block: BlockCipher::new(&out_key),
            in_block: BlockCipher::new(&in_key),
            iv_block: BlockCipher::new(&schedule.iv_key),
            mac_key: schedule.mac_key,
            iv_nonce: schedule.iv_nonce,
        })
    }

    fn iv_for(&self, seq: u32) -> [u8; BLOCK_LEN] {
        let mut block = [0u8; BLOCK_LEN];
        block[..IV_NONCE_LEN].copy_from_slice(&self.iv_nonce);
        block[IV_NONCE_LEN..].copy_from_slice(&seq.to_be_bytes());
        self.iv_block.encrypt_block(block)
    }

    /// Leading ciphertext word of a packet carrying `seq`, as the
    /// receiver can predict it: `E_in(IV_seq)[0..4] ⊕ seq_be32`.
    fn watch_tag(&self, seq: u32) -> u32 {
        let keystream = self.in_block.encrypt_block(self.iv_for(seq));
        u32::from_be_bytes(keystream[..4].try_into().expect("fixed split")) ^ seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unverified,
    Current,
    Previous,
    Deprecated,
}

/// One fragment of one message carried by a sent packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFragment {
    pub message_id: u32,
    pub offset: u32,
    pub len: u32,
}

/// In-flight packet descriptor, kept until acked or declared lost.
#[derive(Debug, Clone)]
pub struct SentPacketRecord {
    pub seq: u32,
    pub sent_at: Duration,
    pub fragments: Vec<SentFragment>,
}

struct Watchlist {
    tags: Vec<u32>,
    first_seq: u32,
    head: usize,
}

impl Watchlist {
    fn new(keys: &SessionKeys, center: u32) -> Self {
        let first_seq = serial::sub(center, WATCHLIST_HALF, SEQ_BITS);
        let tags = (0..WATCHLIST_SIZE as u32)
            .map(|i| keys.watch_tag(serial::add(first_seq, i, SEQ_BITS)))
            .collect();
        Self {
            tags,
            first_seq,
            head: 0,
        }
    }

    /// Shift the window so it is centred on `center` again. Only the
    /// newly uncovered high-end slots are recomputed.
    fn recentre(&mut self, keys: &SessionKeys, center: u32) {
        let desired_first = serial::sub(center, WATCHLIST_HALF, SEQ_BITS);
        let shift = serial::distance(self.first_seq, desired_first, SEQ_BITS);
        if shift == 0 {
            return;
        }
        if shift as usize >= WATCHLIST_SIZE {
            *self = Self::new(keys, center);
            return;
        }
        for i in 0..shift {
            let seq = serial::add(self.first_seq, WATCHLIST_SIZE as u32 + i, SEQ_BITS);
            let slot = (self.head + i as usize) % WATCHLIST_SIZE;
            self.tags[slot] = keys.watch_tag(seq);
        }
        self.head = (self.head + shift as usize) % WATCHLIST_SIZE;
        self.first_seq = desired_first;
    }

    fn candidates(&self, probe: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for (slot, &tag) in self.tags.iter().enumerate() {
            if tag == probe {
                let offset = (slot + WATCHLIST_SIZE - self.head) % WATCHLIST_SIZE;
                out.push(serial::add(self.first_seq, offset as u32, SEQ_BITS));
            }
        }
        out
    }
}

pub struct KeyTracker {
    keys: SessionKeys,
    state: TrackerState,
    created_at: Duration,
    next_out_seq: u32,
    first_out_seq_used: Option<u32>,
    highest_in_seq: u32,
    watchlist: Watchlist,
    sent: HashMap<u32, SentPacketRecord>,
    bytes_processed: u64,
    packets_sent: u64,
    packets_received: u64,
}

impl KeyTracker {
    pub fn new(keys: SessionKeys, now: Duration) -> Self {
        let watchlist = Watchlist::new(&keys, 0);
        Self {
            keys,
            state: TrackerState::Unverified,
            created_at: now,
            next_out_seq: 0,
            first_out_seq_used: None,
            highest_in_seq: 0,
            watchlist,
            sent: HashMap::new(),
            bytes_processed: 0,
            packets_sent: 0,
            packets_received: 0,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn set_state(&mut self, state: TrackerState) {
        self.state = state;
    }

    pub fn deprecate(&mut self) {
        self.state = TrackerState::Deprecated;
    }

    pub fn created_at(&self) -> Duration {
        self.created_at
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    // ── Outgoing ────────────────────────────────────────────────────────

    /// Allocate the next outgoing sequence number; `None` once the space
    /// has wrapped all the way around to the first number ever used.
    pub fn next_outgoing_seq(&mut self) -> Option<u32> {
        if let Some(first) = self.first_out_seq_used {
            if self.next_out_seq == first {
                return None;
            }
        }
        let seq = self.next_out_seq;
        if self.first_out_seq_used.is_none() {
            self.first_out_seq_used = Some(seq);
        }
        self.next_out_seq = serial::add(seq, 1, SEQ_BITS);
        Some(seq)
    }

    /// Sequence numbers left before exhaustion.
    pub fn remaining_seqs(&self) -> u32 {
        match self.first_out_seq_used {
            None => SEQ_MOD,
            Some(first) => serial::distance(self.next_out_seq, first, SEQ_BITS),
        }
    }

    /// Encrypt and authenticate one packet interior under `seq`.
    pub fn encrypt_outgoing(&mut self, seq: u32, interior: &[u8]) -> Vec<u8> {
        let iv = self.keys.iv_for(seq);
        let mut body = Vec::with_capacity(4 + interior.len());
        body.extend_from_slice(&seq.to_be_bytes());
        body.extend_from_slice(interior);
        wr_crypto::CfbStream::new(&self.keys.out_block, &iv).encrypt(&mut body);

        let tag = hmac_sha256(&self.keys.mac_key, &[&body]);
        let mut out = Vec::with_capacity(PACKET_MAC_LEN + body.len());
        out.extend_from_slice(&tag[..PACKET_MAC_LEN]);
        out.extend_from_slice(&body);

        self.bytes_processed += out.len() as u64;
        self.packets_sent += 1;
        out
    }

    pub fn record_sent(&mut self, record: SentPacketRecord) {
        self.sent.insert(record.seq, record);
    }

    pub fn take_sent(&mut self, seq: u32) -> Option<SentPacketRecord> {
        self.sent.remove(&seq)
    }

    /// Remove and return packets sent at or before `cutoff`.
    pub fn take_timed_out(&mut self, cutoff: Duration) -> Vec<SentPacketRecord> {
        let seqs: Vec<u32> = self
            .sent
            .iter()
            .filter(|(_, r)| r.sent_at <= cutoff)
            .map(|(&s, _)| s)
            .collect();
        seqs.into_iter()
            .filter_map(|s| self.sent.remove(&s))
            .collect()
    }

    /// Drop every in-flight record (tracker going away).
    pub fn drain_sent(&mut self) -> Vec<SentPacketRecord> {
        self.sent.drain().map(|(_, r)| r).collect()
    }

    // ── Incoming ────────────────────────────────────────────────────────

    /// Match, authenticate and decrypt one incoming datagram. `None` for
    /// anything that is not a packet of this tracker.
    pub fn try_decrypt_incoming(&mut self, datagram: &[u8]) -> Option<(u32, Vec<u8>)> {
        if datagram.len() < PACKET_MAC_LEN + 4 {
            return None;
        }
        let (mac, ct) = datagram.split_at(PACKET_MAC_LEN);
        let probe = u32::from_be_bytes(ct[..4].try_into().expect("fixed split"));

        let candidates = self.watchlist.candidates(probe);
        if candidates.is_empty() {
            return None;
        }
        if hmac_verify_truncated(&self.keys.mac_key, &[ct], mac).is_err() {
            return None;
        }

        for seq in candidates {
            let iv = self.keys.iv_for(seq);
            let mut body = ct.to_vec();
            wr_crypto::CfbStream::new(&self.keys.in_block, &iv).decrypt(&mut body);
            let got = u32::from_be_bytes(body[..4].try_into().expect("fixed split"));
            if got != seq {
                continue;
            }
            self.record_incoming(seq);
            self.bytes_processed += datagram.len() as u64;
            self.packets_received += 1;
            body.drain(..4);
            return Some((seq, body));
        }
        None
    }

    /// Advance `highest_in_seq` (31-bit serial order) and re-centre the
    /// watchlist on it.
    pub fn record_incoming(&mut self, seq: u32) {
        if serial::seq_newer(seq, self.highest_in_seq) {
            self.highest_in_seq = seq;
            self.watchlist.recentre(&self.keys, seq);
        }
    }

    /// Should the owner start a rekey for this tracker?
    pub fn rekey_due(
        &self,
        now: Duration,
        seq_headroom: u32,
        byte_limit: u64,
        max_age: Duration,
    ) -> bool {
        self.remaining_seqs() < seq_headroom
            || self.bytes_processed >= byte_limit
            || now.saturating_sub(self.created_at) >= max_age
    }

    #[cfg(test)]
    fn force_outgoing_position(&mut self, next: u32, first: Option<u32>) {
        self.next_out_seq = next;
        self.first_out_seq_used = first;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(now: Duration) -> (KeyTracker, KeyTracker) {
        let master = [9u8; 32];
        let a = KeyTracker::new(SessionKeys::from_master(&master, true).unwrap(), now);
        let b = KeyTracker::new(SessionKeys::from_master(&master, false).unwrap(), now);
        (a, b)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (mut a, mut b) = pair(Duration::ZERO);
        for i in 0..20u32 {
            let seq = a.next_outgoing_seq().unwrap();
            assert_eq!(seq, i);
            let interior = format!("packet number {i}").into_bytes();
            let wire = a.encrypt_outgoing(seq, &interior);
            let (got_seq, got) = b.try_decrypt_incoming(&wire).expect("decrypts");
            assert_eq!(got_seq, seq);
            assert_eq!(got, interior);
        }
    }

    #[test]
    fn directions_are_independent() {
        let (mut a, mut b) = pair(Duration::ZERO);
        let seq = b.next_outgoing_seq().unwrap();
        let wire = b.encrypt_outgoing(seq, b"from responder");
        let (_, got) = a.try_decrypt_incoming(&wire).expect("decrypts");
        assert_eq!(got, b"from responder");
        // A datagram is never accepted by its own sender.
        let seq = a.next_outgoing_seq().unwrap();
        let wire = a.encrypt_outgoing(seq, b"loop");
        assert!(a.try_decrypt_incoming(&wire).is_none());
    }

    #[test]
    fn tampered_packet_rejected() {
        let (mut a, mut b) = pair(Duration::ZERO);
        let seq = a.next_outgoing_seq().unwrap();
        let wire = a.encrypt_outgoing(seq, b"payload bytes");
        for i in 0..wire.len() {
            let mut bad = wire.clone();
            bad[i] ^= 0x80;
            assert!(b.try_decrypt_incoming(&bad).is_none(), "flip at {i}");
        }
        // Untouched original still decrypts.
        assert!(b.try_decrypt_incoming(&wire).is_some());
    }

    #[test]
    fn watchlist_matches_window_and_rejects_outside() {
        let (mut a, mut b) = pair(Duration::ZERO);
        // Move the senders's cursor far ahead; the receiver has no idea.
        a.force_outgoing_position(WATCHLIST_HALF + 100, Some(0));
        let seq = a.next_outgoing_seq().unwrap();
        let wire = a.encrypt_outgoing(seq, b"beyond the window");
        assert!(b.try_decrypt_incoming(&wire).is_none());

        // Within the upper half of the window it matches.
        let mut a2 = {
            let master = [9u8; 32];
            KeyTracker::new(SessionKeys::from_master(&master, true).unwrap(), Duration::ZERO)
        };
        a2.force_outgoing_position(WATCHLIST_HALF - 1, Some(0));
        let seq = a2.next_outgoing_seq().unwrap();
        let wire = a2.encrypt_outgoing(seq, b"inside the window");
        assert!(b.try_decrypt_incoming(&wire).is_some());
    }

    #[test]
    fn watchlist_slides_with_highest_seq() {
        let (mut a, mut b) = pair(Duration::ZERO);
        // Receive a long monotonically increasing run; every packet must
        // match even as the window shifts.
        for _ in 0..(WATCHLIST_SIZE * 3) {
            let seq = a.next_outgoing_seq().unwrap();
            let wire = a.encrypt_outgoing(seq, b"x");
            assert!(b.try_decrypt_incoming(&wire).is_some(), "seq {seq}");
        }
        // A packet half a window behind the new highest still matches.
        let old_seq = (WATCHLIST_SIZE as u32 * 3) - WATCHLIST_HALF + 2;
        let wire = a.encrypt_outgoing(old_seq, b"late");
        assert!(b.try_decrypt_incoming(&wire).is_some());
    }

    #[test]
    fn sequence_space_exhaustion() {
        let (mut a, _) = pair(Duration::ZERO);
        a.force_outgoing_position(5, Some(7));
        assert_eq!(a.next_outgoing_seq(), Some(5));
        assert_eq!(a.next_outgoing_seq(), Some(6));
        assert_eq!(a.next_outgoing_seq(), None);
        assert_eq!(a.remaining_seqs(), 0);
    }

    #[test]
    fn rekey_triggers() {
        let (mut a, _) = pair(Duration::from_secs(100));
        let headroom = 100;
        let bytes = 1 << 20;
        let age = Duration::from_secs(3600);

        assert!(!a.rekey_due(Duration::from_secs(100), headroom, bytes, age));

        // Sequence headroom.
        a.force_outgoing_position(50, Some(120));
        assert!(a.remaining_seqs() < headroom);
        assert!(a.rekey_due(Duration::from_secs(100), headroom, bytes, age));

        // Byte volume.
        let (mut c, _) = pair(Duration::from_secs(100));
        c.bytes_processed = bytes;
        assert!(c.rekey_due(Duration::from_secs(100), headroom, bytes, age));

        // Age.
        let (d, _) = pair(Duration::from_secs(100));
        assert!(d.rekey_due(Duration::from_secs(100) + age, headroom, bytes, age));
    }

    #[test]
    fn sent_packet_bookkeeping() {
        let (mut a, _) = pair(Duration::ZERO);
        for seq in 0..5u32 {
            a.record_sent(SentPacketRecord {
                seq,
                sent_at: Duration::from_millis(u64::from(seq) * 100),
                fragments: vec![],
            });
        }
        assert!(a.take_sent(3).is_some());
        assert!(a.take_sent(3).is_none());
        let timed_out = a.take_timed_out(Duration::from_millis(100));
        let mut seqs: Vec<u32> = timed_out.iter().map(|r| r.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(a.drain_sent().len(), 2);
    }
}

//! Session packetizer: the per-peer tracker trio.
//!
//! Holds at most one tracker in each of the current / previous /
//! unverified slots. Inbound datagrams are trial-matched in that order;
//! a first successful decrypt on the unverified tracker promotes it
//! (current → previous, old previous → deprecated). Outbound packets
//! are padded, encrypted on the newest usable tracker, and recorded for
//! loss detection. This layer also watches the rekey triggers and the
//! grace period after them.

use std::time::Duration;

use rand::rngs::OsRng;
use tracing::{debug, info};

use wr_proto::{frame_interior, padding};

use crate::config::LinkConfig;
use crate::tracker::{KeyTracker, SentPacketRecord, SessionKeys, TrackerState};

pub struct SessionState {
    current: Option<KeyTracker>,
    previous: Option<KeyTracker>,
    unverified: Option<KeyTracker>,
    /// When the earliest unserviced rekey trigger fired.
    rekey_triggered_at: Option<Duration>,
    /// When the previous slot was last filled; it drains for at most a
    /// handshake timeout.
    previous_since: Option<Duration>,
    /// Completed handshakes on this session (diagnostics).
    generations: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            current: None,
            previous: None,
            unverified: None,
            rekey_triggered_at: None,
            previous_since: None,
            generations: 0,
        }
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    pub fn generations(&self) -> u64 {
        self.generations
    }

    /// Install the tracker produced by a completed handshake.
    ///
    /// The initiator knows the exchange is complete and installs
    /// straight into the current slot; the responder parks the tracker
    /// as unverified until the first packet decrypts on it. Returns the
    /// in-flight records of any tracker deprecated by the shuffle.
    pub fn install(
        &mut self,
        keys: SessionKeys,
        initiator: bool,
        now: Duration,
    ) -> Vec<SentPacketRecord> {
        let mut lost = Vec::new();
        let mut tracker = KeyTracker::new(keys, now);
        self.generations += 1;
        self.rekey_triggered_at = None;

        if initiator {
            tracker.set_state(TrackerState::Current);
            if let Some(mut old_prev) = self.previous.take() {
                old_prev.deprecate();
                lost.extend(old_prev.drain_sent());
            }
            if let Some(mut old_cur) = self.current.take() {
                old_cur.set_state(TrackerState::Previous);
                self.previous = Some(old_cur);
                self.previous_since = Some(now);
            }
            self.current = Some(tracker);
        } else {
            if let Some(mut old) = self.unverified.take() {
                old.deprecate();
                lost.extend(old.drain_sent());
            }
            self.unverified = Some(tracker);
        }
        debug!(initiator, generation = self.generations, "tracker installed");
        lost
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Trial-decrypt against current → previous → unverified. A success
    /// on the unverified tracker promotes it; records deprecated along
    /// the way are returned so the channel can repack them.
    pub fn decrypt(
        &mut self,
        datagram: &[u8],
        now: Duration,
    ) -> Option<(u32, Vec<u8>, Vec<SentPacketRecord>)> {
        if let Some(tracker) = self.current.as_mut() {
            if let Some((seq, interior)) = tracker.try_decrypt_incoming(datagram) {
                return Some((seq, interior, Vec::new()));
            }
        }
        if let Some(tracker) = self.previous.as_mut() {
            if let Some((seq, interior)) = tracker.try_decrypt_incoming(datagram) {
                return Some((seq, interior, Vec::new()));
            }
        }
        if let Some(tracker) = self.unverified.as_mut() {
            if let Some((seq, interior)) = tracker.try_decrypt_incoming(datagram) {
                let mut lost = Vec::new();
                if let Some(mut old_prev) = self.previous.take() {
                    old_prev.deprecate();
                    lost.extend(old_prev.drain_sent());
                }
                if let Some(mut old_cur) = self.current.take() {
                    old_cur.set_state(TrackerState::Previous);
                    self.previous = Some(old_cur);
                    self.previous_since = Some(now);
                }
                let mut promoted = self.unverified.take().expect("checked above");
                promoted.set_state(TrackerState::Current);
                self.current = Some(promoted);
                info!("unverified tracker promoted to current");
                return Some((seq, interior, lost));
            }
        }
        None
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Pad, frame and encrypt one packet's records. Returns the wire
    /// datagram and the sequence number it was sent under, or `None`
    /// when no tracker can send (nothing installed, or exhausted).
    pub fn encrypt_packet(&mut self, records: &[u8], cfg: &LinkConfig) -> Option<(Vec<u8>, u32)> {
        debug_assert!(records.len() <= cfg.max_records_len());
        let tracker = self.sendable_tracker()?;
        let seq = tracker.next_outgoing_seq()?;

        // Interior = len ∥ records ∥ padding; budget excludes the MAC and
        // the sequence number.
        let budget = cfg.mtu - wr_crypto::PACKET_MAC_LEN - 4;
        let target = padding::padded_len(records.len() + 2, budget, &mut OsRng);
        let interior = frame_interior(records, target, &mut OsRng);
        let wire = tracker.encrypt_outgoing(seq, &interior);
        debug_assert!(wire.len() <= cfg.mtu);
        Some((wire, seq))
    }

    /// Record an in-flight packet on the tracker that sent it.
    pub fn record_sent(&mut self, record: SentPacketRecord) {
        if let Some(tracker) = self.sendable_tracker() {
            tracker.record_sent(record);
        }
    }

    /// The tracker new packets go out on: current if present, otherwise
    /// the unverified one (a responder may answer before its tracker has
    /// been promoted).
    fn sendable_tracker(&mut self) -> Option<&mut KeyTracker> {
        if self.current.is_some() {
            return self.current.as_mut();
        }
        self.unverified.as_mut()
    }

    // ── Ack / loss plumbing ─────────────────────────────────────────────

    /// Look an acked sequence number up across the trio.
    pub fn take_acked(&mut self, seq: u32) -> Option<SentPacketRecord> {
        for tracker in [&mut self.current, &mut self.previous, &mut self.unverified]
            .into_iter()
            .flatten()
        {
            if let Some(record) = tracker.take_sent(seq) {
                return Some(record);
            }
        }
        None
    }

    /// Packets sent at or before `cutoff`, across the trio.
    pub fn take_timed_out(&mut self, cutoff: Duration) -> Vec<SentPacketRecord> {
        let mut out = Vec::new();
        for tracker in [&mut self.current, &mut self.previous, &mut self.unverified]
            .into_iter()
            .flatten()
        {
            out.extend(tracker.take_timed_out(cutoff));
        }
        out
    }

    /// Drop the previous tracker once it has drained for a handshake
    /// timeout; anything still unacked on it is declared lost.
    pub fn expire_previous(&mut self, now: Duration, handshake_timeout: Duration) -> Vec<SentPacketRecord> {
        let expired = matches!(self.previous_since, Some(t) if now.saturating_sub(t) >= handshake_timeout);
        if !expired {
            return Vec::new();
        }
        self.previous_since = None;
        match self.previous.take() {
            Some(mut tracker) => {
                tracker.deprecate();
                debug!("previous tracker expired");
                tracker.drain_sent()
            }
            None => Vec::new(),
        }
    }

    /// Tear the whole session down (disconnect or peer restart).
    pub fn reset(&mut self) -> Vec<SentPacketRecord> {
        let mut lost = Vec::new();
        for slot in [&mut self.current, &mut self.previous, &mut self.unverified] {
            if let Some(mut tracker) = slot.take() {
                tracker.deprecate();
                lost.extend(tracker.drain_sent());
            }
        }
        self.rekey_triggered_at = None;
        self.previous_since = None;
        lost
    }

    // ── Rekey policy ────────────────────────────────────────────────────

    /// Check the rekey triggers on the sending tracker, latching the
    /// trigger time. Returns true while a rekey is wanted.
    pub fn rekey_needed(&mut self, now: Duration, cfg: &LinkConfig) -> bool {
        let due = match self.sendable_tracker_ref() {
            Some(t) => t.rekey_due(
                now,
                cfg.rekey_seq_headroom,
                cfg.rekey_byte_limit,
                cfg.rekey_max_age,
            ),
            None => false,
        };
        if due && self.rekey_triggered_at.is_none() {
            self.rekey_triggered_at = Some(now);
            info!("rekey trigger fired");
        }
        due
    }

    /// Has a fired trigger gone unserviced past the grace period?
    pub fn rekey_overrun(&self, now: Duration, cfg: &LinkConfig) -> bool {
        matches!(self.rekey_triggered_at, Some(t) if now.saturating_sub(t) > cfg.rekey_grace)
    }

    fn sendable_tracker_ref(&self) -> Option<&KeyTracker> {
        self.current.as_ref().or(self.unverified.as_ref())
    }

    /// Can a packet go out right now (tracker present, space left)?
    pub fn can_send(&self) -> bool {
        self.sendable_tracker_ref()
            .map(|t| t.remaining_seqs() > 0)
            .unwrap_or(false)
    }

    pub fn current_state(&self) -> Option<TrackerState> {
        self.current.as_ref().map(|t| t.state())
    }

    pub fn bytes_processed(&self) -> u64 {
        [&self.current, &self.previous, &self.unverified]
            .into_iter()
            .flatten()
            .map(|t| t.bytes_processed())
            .sum()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

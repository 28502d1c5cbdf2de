//! Reliable, in-order message channel over the session packetizer.
//!
//! Outbound: application messages wait in per-priority queues, get a
//! 28-bit message ID when first packed, and are chopped into fragments
//! that fill whatever room a packet has left after acknowledgements.
//! Loss is detected per packet (`2 × avg_rtt`, floored); lost fragments
//! rejoin the message's pending ranges and are repacked.
//!
//! Inbound: fragments reassemble into length-known buffers; completed
//! messages surface in message-ID order, which preserves per-priority
//! enqueue order end to end. Both directions are bounded by a 256 KiB
//! buffer budget — the local one backs receive allocations, the remote
//! one is our running estimate of the peer's.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use wr_proto::serial;
use wr_proto::{ack_block_len, Fragment, PacketPayload, FRAGMENT_HEADER_MAX, MSG_ID_BITS};

use crate::config::LinkConfig;
use crate::ranges::SparseRanges;
use crate::tracker::{SentFragment, SentPacketRecord};

/// Outbound message-ID window: IDs further than this from the oldest
/// unacknowledged one cannot be allocated yet.
pub const MSG_ID_WINDOW: u32 = 1 << 16;

/// Fixed priority levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Control = 0,
    High = 1,
    Normal = 2,
    Bulk = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Control,
        Priority::High,
        Priority::Normal,
        Priority::Bulk,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Resolution of a `Peer::send` future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Disconnected,
}

struct QueuedMessage {
    payload: Vec<u8>,
    completion: Option<oneshot::Sender<SendOutcome>>,
}

struct OutboundMessage {
    payload: Vec<u8>,
    priority: Priority,
    /// Ranges that still need (re)transmission.
    pending: SparseRanges,
    /// Ranges the peer has acknowledged.
    acked: SparseRanges,
    /// An empty message's single header-only fragment awaits (re)send.
    needs_empty_fragment: bool,
    completion: Option<oneshot::Sender<SendOutcome>>,
}

impl OutboundMessage {
    fn is_fully_acked(&self) -> bool {
        if self.payload.is_empty() {
            // Completion of empty messages is decided directly on ack.
            false
        } else {
            self.acked.covers(0, self.payload.len() as u32)
        }
    }
}

struct InboundMessage {
    buffer: Vec<u8>,
    received: SparseRanges,
    known_length: Option<u32>,
    /// Bytes charged against `used_local_buffer` for this message.
    accounted: usize,
}

/// Records and encoded bytes for one packet about to be sent.
pub struct BuiltPayload {
    pub bytes: Vec<u8>,
    pub fragments: Vec<SentFragment>,
}

/// What a batch of inbound fragments produced.
#[derive(Default)]
pub struct ReceiveOutcome {
    /// Fully reassembled messages, in delivery (message-ID) order.
    /// Zero-length entries are link-internal and not for the app.
    pub deliveries: Vec<Vec<u8>>,
    /// False when a fragment had to be refused for lack of buffer space;
    /// the packet must then not be acknowledged.
    pub all_buffered: bool,
}

pub struct ReliableChannel {
    cfg: Arc<LinkConfig>,

    // Outbound.
    next_msg_id: u32,
    acked_window_base: u32,
    acked_ids: HashSet<u32>,
    queues: [VecDeque<QueuedMessage>; 4],
    active: [VecDeque<u32>; 4],
    outbound: HashMap<u32, OutboundMessage>,
    used_remote_buffer: usize,
    blocked_since: Option<Duration>,

    // Inbound.
    recv_window_base: u32,
    inbound: HashMap<u32, InboundMessage>,
    completed: HashMap<u32, Vec<u8>>,
    used_local_buffer: usize,

    // Acks and timing.
    ack_pending: VecDeque<u32>,
    ack_pending_set: HashSet<u32>,
    avg_rtt: Option<Duration>,
}

impl ReliableChannel {
    pub fn new(cfg: Arc<LinkConfig>) -> Self {
        Self {
            cfg,
            next_msg_id: 0,
            acked_window_base: 0,
            acked_ids: HashSet::new(),
            queues: Default::default(),
            active: Default::default(),
            outbound: HashMap::new(),
            used_remote_buffer: 0,
            blocked_since: None,
            recv_window_base: 0,
            inbound: HashMap::new(),
            completed: HashMap::new(),
            used_local_buffer: 0,
            ack_pending: VecDeque::new(),
            ack_pending_set: HashSet::new(),
            avg_rtt: None,
        }
    }

    // ── Enqueue / acks in ───────────────────────────────────────────────

    pub fn enqueue(
        &mut self,
        payload: Vec<u8>,
        priority: Priority,
        completion: Option<oneshot::Sender<SendOutcome>>,
    ) {
        debug_assert!(payload.len() <= self.cfg.max_message_len);
        self.queues[priority.index()].push_back(QueuedMessage {
            payload,
            completion,
        });
    }

    /// Queue a packet sequence number for acknowledgement.
    pub fn queue_ack(&mut self, seq: u32) {
        if self.ack_pending_set.insert(seq) {
            self.ack_pending.push_back(seq);
        }
    }

    pub fn has_work(&self) -> bool {
        !self.ack_pending.is_empty()
            || self.queues.iter().any(|q| !q.is_empty())
            || self.active.iter().flatten().any(|id| {
                self.outbound
                    .get(id)
                    .map(|m| !m.pending.is_empty() || m.needs_empty_fragment)
                    .unwrap_or(false)
            })
    }

    // ── Packet building ─────────────────────────────────────────────────

    /// Compose the records of the next outgoing packet within `max_len`
    /// bytes. Acks first, then per priority: continuations, then fresh
    /// messages. `None` when there is nothing worth a packet.
    pub fn build_payload(&mut self, max_len: usize, now: Duration) -> Option<BuiltPayload> {
        let mut acks = Vec::new();
        while let Some(&seq) = self.ack_pending.front() {
            if ack_block_len(acks.len() + 1) > max_len {
                break;
            }
            self.ack_pending.pop_front();
            self.ack_pending_set.remove(&seq);
            acks.push(seq);
        }

        let mut budget = max_len - ack_block_len(acks.len());
        let mut fragments = Vec::new();
        let mut sent = Vec::new();

        // Allocation unblocks as soon as the window has room again.
        if serial::distance(self.acked_window_base, self.next_msg_id, MSG_ID_BITS) < MSG_ID_WINDOW {
            self.blocked_since = None;
        }

        for priority in Priority::ALL {
            let pri = priority.index();

            // Continue already-started messages first.
            let ids: Vec<u32> = self.active[pri].iter().copied().collect();
            for id in ids {
                self.emit_from(id, &mut budget, &mut fragments, &mut sent);
                if budget <= FRAGMENT_HEADER_MAX {
                    break;
                }
            }
            if budget <= FRAGMENT_HEADER_MAX {
                break;
            }

            // Then pull fresh messages from this priority's queue.
            while budget > FRAGMENT_HEADER_MAX {
                let Some(front) = self.queues[pri].front() else {
                    break;
                };
                if serial::distance(self.acked_window_base, self.next_msg_id, MSG_ID_BITS)
                    >= MSG_ID_WINDOW
                {
                    // Window exhausted; allocation blocks cooperatively.
                    if self.blocked_since.is_none() {
                        warn!("outbound message-id window exhausted");
                        self.blocked_since = Some(now);
                    }
                    break;
                }
                if self.used_remote_buffer + front.payload.len() > self.cfg.buffer_cap {
                    trace!("peer buffer estimate full, holding fresh messages");
                    break;
                }

                let msg = self.queues[pri].pop_front().expect("front observed");
                let id = self.next_msg_id;
                self.next_msg_id = serial::add(self.next_msg_id, 1, MSG_ID_BITS);
                self.used_remote_buffer += msg.payload.len();

                let mut pending = SparseRanges::new();
                if !msg.payload.is_empty() {
                    pending.insert(0, msg.payload.len() as u32);
                }
                self.outbound.insert(
                    id,
                    OutboundMessage {
                        needs_empty_fragment: msg.payload.is_empty(),
                        payload: msg.payload,
                        priority,
                        pending,
                        acked: SparseRanges::new(),
                        completion: msg.completion,
                    },
                );
                self.active[pri].push_back(id);
                self.emit_from(id, &mut budget, &mut fragments, &mut sent);
            }
        }

        if acks.is_empty() && fragments.is_empty() {
            return None;
        }
        let payload = PacketPayload { acks, fragments };
        debug_assert!(payload.encoded_len() <= max_len);
        Some(BuiltPayload {
            bytes: payload.encode(),
            fragments: sent,
        })
    }

    /// Emit as many fragments of one message as the budget allows.
    fn emit_from(
        &mut self,
        id: u32,
        budget: &mut usize,
        fragments: &mut Vec<Fragment>,
        sent: &mut Vec<SentFragment>,
    ) {
        let Some(msg) = self.outbound.get_mut(&id) else {
            return;
        };

        if msg.needs_empty_fragment {
            let frag = Fragment::first(id, 0, Vec::new());
            if frag.encoded_len() > *budget {
                return;
            }
            *budget -= frag.encoded_len();
            fragments.push(frag);
            sent.push(SentFragment {
                message_id: id,
                offset: 0,
                len: 0,
            });
            msg.needs_empty_fragment = false;
            return;
        }

        loop {
            if *budget <= FRAGMENT_HEADER_MAX {
                return;
            }
            let max_data = (*budget - FRAGMENT_HEADER_MAX) as u32;
            let Some((start, end)) = msg.pending.take_first(max_data) else {
                return;
            };
            let data = msg.payload[start as usize..end as usize].to_vec();
            let frag = if start == 0 {
                Fragment::first(id, msg.payload.len() as u32, data)
            } else {
                Fragment::continuation(id, start, data)
            };
            debug_assert!(frag.encoded_len() <= *budget);
            *budget -= frag.encoded_len();
            fragments.push(frag);
            sent.push(SentFragment {
                message_id: id,
                offset: start,
                len: end - start,
            });
        }
    }

    // ── Ack / loss handling ─────────────────────────────────────────────

    /// One of our packets was acknowledged.
    pub fn handle_ack_record(&mut self, record: SentPacketRecord, now: Duration) {
        let sample = now.saturating_sub(record.sent_at);
        self.avg_rtt = Some(match self.avg_rtt {
            None => sample,
            Some(avg) => {
                let nanos = (avg.as_nanos() * 7 + sample.as_nanos()) / 8;
                Duration::from_nanos(nanos as u64)
            }
        });

        for frag in record.fragments {
            let Some(msg) = self.outbound.get_mut(&frag.message_id) else {
                continue;
            };
            let complete = if frag.len == 0 {
                msg.payload.is_empty()
            } else {
                msg.acked.insert(frag.offset, frag.offset + frag.len);
                msg.is_fully_acked()
            };
            if complete {
                self.complete_outbound(frag.message_id);
            }
        }
    }

    /// One of our packets was declared lost; its fragments go back to
    /// pending so they are repacked.
    pub fn handle_timeout_record(&mut self, record: SentPacketRecord) {
        for frag in record.fragments {
            let Some(msg) = self.outbound.get_mut(&frag.message_id) else {
                continue;
            };
            if frag.len == 0 {
                if msg.payload.is_empty() {
                    msg.needs_empty_fragment = true;
                }
                continue;
            }
            msg.pending.insert(frag.offset, frag.offset + frag.len);
            // Parts acked through another packet stay acked.
            msg.pending.subtract(&msg.acked);
        }
        trace!(seq = record.seq, "packet declared lost");
    }

    fn complete_outbound(&mut self, id: u32) {
        let Some(mut msg) = self.outbound.remove(&id) else {
            return;
        };
        self.active[msg.priority.index()].retain(|&x| x != id);
        self.used_remote_buffer = self
            .used_remote_buffer
            .saturating_sub(msg.payload.len());
        if let Some(tx) = msg.completion.take() {
            let _ = tx.send(SendOutcome::Sent);
        }

        self.acked_ids.insert(id);
        while self.acked_ids.remove(&self.acked_window_base) {
            self.acked_window_base = serial::add(self.acked_window_base, 1, MSG_ID_BITS);
        }
        trace!(id, "outbound message fully acknowledged");
    }

    /// The loss deadline for in-flight packets.
    pub fn loss_timeout(&self) -> Duration {
        match self.avg_rtt {
            Some(avg) => (avg * 2).max(self.cfg.loss_timeout_floor),
            None => self.cfg.loss_timeout_floor,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.avg_rtt
    }

    /// True when message-ID allocation has been blocked past the limit.
    pub fn window_stalled(&self, now: Duration) -> bool {
        matches!(self.blocked_since, Some(t) if now.saturating_sub(t) > self.cfg.msg_id_block_limit)
    }

    // ── Receive path ────────────────────────────────────────────────────

    /// Process the fragments of one decrypted packet.
    pub fn handle_fragments(&mut self, fragments: Vec<Fragment>) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome {
            deliveries: Vec::new(),
            all_buffered: true,
        };

        for frag in fragments {
            let id = frag.message_id;
            // Outside the receive window (including already-delivered
            // IDs): drop, but let the packet be acked so the sender
            // stops retransmitting.
            let dist = serial::distance(self.recv_window_base, id, MSG_ID_BITS);
            if dist >= MSG_ID_WINDOW {
                trace!(id, "fragment outside receive window");
                continue;
            }
            // Completed but not yet passed by the window: duplicate.
            if self.completed.contains_key(&id) {
                continue;
            }

            let end = frag.offset as usize + frag.data.len();
            if let Some(total) = frag.message_length {
                if end > total as usize {
                    debug!(id, "fragment overruns its declared message length");
                    continue;
                }
            }
            if end > self.cfg.max_message_len {
                debug!(id, "fragment overruns the message cap");
                continue;
            }

            // Size the buffer: exact when the first fragment told us the
            // length, grow-on-demand otherwise.
            let needed = match (frag.message_length, self.inbound.get(&id)) {
                (Some(total), Some(existing)) => (total as usize).max(existing.buffer.len()),
                (Some(total), None) => total as usize,
                (None, Some(existing)) => end.max(existing.buffer.len()),
                (None, None) => end,
            };

            let charged = self.inbound.get(&id).map(|m| m.accounted).unwrap_or(0);
            let delta = needed.saturating_sub(charged);
            if delta > 0 && self.used_local_buffer + delta > self.cfg.buffer_cap {
                debug!(id, "receive buffer budget exhausted, refusing fragment");
                outcome.all_buffered = false;
                continue;
            }

            let entry = self.inbound.entry(id).or_insert_with(|| InboundMessage {
                buffer: Vec::new(),
                received: SparseRanges::new(),
                known_length: None,
                accounted: 0,
            });
            if entry.buffer.len() < needed {
                entry.buffer.resize(needed, 0);
            }
            self.used_local_buffer += delta;
            entry.accounted += delta;
            if let Some(total) = frag.message_length {
                entry.known_length = Some(total);
            }

            if !frag.data.is_empty() {
                entry.buffer[frag.offset as usize..end].copy_from_slice(&frag.data);
                entry.received.insert(frag.offset, end as u32);
            }

            let complete = match entry.known_length {
                Some(0) => true,
                Some(total) => entry.received.covers(0, total),
                None => false,
            };
            if complete {
                let total = entry.known_length.expect("checked above") as usize;
                let entry = self.inbound.remove(&id).expect("entry exists");
                self.used_local_buffer = self.used_local_buffer.saturating_sub(entry.accounted);
                let mut buffer = entry.buffer;
                buffer.truncate(total);
                self.completed.insert(id, buffer);

                // Deliver in message-ID order.
                while let Some(ready) = self.completed.remove(&self.recv_window_base) {
                    outcome.deliveries.push(ready);
                    self.recv_window_base = serial::add(self.recv_window_base, 1, MSG_ID_BITS);
                }
            }
        }

        outcome
    }

    // ── Buffer accounting / teardown ────────────────────────────────────

    pub fn used_local_buffer(&self) -> usize {
        self.used_local_buffer
    }

    pub fn used_remote_buffer(&self) -> usize {
        self.used_remote_buffer
    }

    /// Tear everything down: pending and in-flight sends resolve as
    /// `Disconnected`, buffers and windows reset.
    pub fn disconnect(&mut self) {
        for queue in &mut self.queues {
            for mut msg in queue.drain(..) {
                if let Some(tx) = msg.completion.take() {
                    let _ = tx.send(SendOutcome::Disconnected);
                }
            }
        }
        for (_, mut msg) in self.outbound.drain() {
            if let Some(tx) = msg.completion.take() {
                let _ = tx.send(SendOutcome::Disconnected);
            }
        }
        for list in &mut self.active {
            list.clear();
        }
        self.used_remote_buffer = 0;
        self.used_local_buffer = 0;
        self.inbound.clear();
        self.completed.clear();
        self.acked_ids.clear();
        self.ack_pending.clear();
        self.ack_pending_set.clear();
        self.blocked_since = None;
        self.next_msg_id = 0;
        self.acked_window_base = 0;
        self.recv_window_base = 0;
        self.avg_rtt = None;
        debug!("channel reset");
    }
}

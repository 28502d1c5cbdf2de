//! Per-peer facade.
//!
//! Thin handle over the node's per-peer state: queue a message and get a
//! completion future, subscribe to reassembled messages, measure a
//! round trip, or tear the session down. Cheap to clone and safe to
//! hold anywhere; it never keeps the peer alive on its own terms beyond
//! the node's registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{Priority, SendOutcome};
use crate::collaborators::{PeerId, PeerInfo};
use crate::error::{FailureReason, LinkError};
use crate::node::{teardown, NodeShared, PeerHandle, PeerStats};

#[derive(Clone)]
pub struct Peer {
    shared: Arc<NodeShared>,
    handle: Arc<PeerHandle>,
}

impl Peer {
    pub(crate) fn new(shared: Arc<NodeShared>, handle: Arc<PeerHandle>) -> Self {
        Self { shared, handle }
    }

    pub fn id(&self) -> PeerId {
        self.handle.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.handle.info
    }

    pub fn is_connected(&self) -> bool {
        self.handle.state.lock().connected
    }

    pub fn stats(&self) -> PeerStats {
        self.shared.stats(&self.handle)
    }

    /// Start a handshake now instead of waiting for queued traffic to
    /// trigger one.
    pub fn connect(&self) {
        let now = self.shared.clock.monotonic();
        let mut outgoing = Vec::new();
        {
            let mut st = self.handle.state.lock();
            if st.hs.is_idle() && !st.connected {
                outgoing.push(
                    self.shared
                        .engine
                        .initiate(&self.handle.crypto, &mut st.hs, now),
                );
            }
        }
        self.shared.flush(&self.handle, outgoing);
        self.shared.wake.notify_one();
    }

    /// Queue `payload` for reliable delivery at `priority`. The returned
    /// future resolves `Sent` once the peer has acknowledged every byte,
    /// or `Disconnected` if the session dies first. Sending to a peer
    /// with no session starts a handshake on demand.
    pub fn send(
        &self,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<oneshot::Receiver<SendOutcome>, LinkError> {
        if payload.is_empty() {
            return Err(LinkError::EmptyPayload);
        }
        if payload.len() > self.shared.cfg.max_message_len {
            return Err(LinkError::MessageTooLong {
                len: payload.len(),
                max: self.shared.cfg.max_message_len,
            });
        }
        let (tx, rx) = oneshot::channel();
        self.handle
            .state
            .lock()
            .channel
            .enqueue(payload, priority, Some(tx));
        self.shared.wake.notify_one();
        Ok(rx)
    }

    /// Install the upstream consumer of reassembled messages. One
    /// callback per peer; installing again replaces it.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.handle.on_message.lock() = Some(Arc::new(callback));
    }

    /// Measure a round trip through the reliable channel: an empty
    /// control message is queued and the time to its full
    /// acknowledgement is reported. `None` on timeout or disconnect.
    pub async fn ping(&self) -> Option<Duration> {
        let (tx, rx) = oneshot::channel();
        let started = self.shared.clock.monotonic();
        self.handle
            .state
            .lock()
            .channel
            .enqueue(Vec::new(), Priority::Control, Some(tx));
        self.shared.wake.notify_one();

        match tokio::time::timeout(self.shared.cfg.ping_timeout, rx).await {
            Ok(Ok(SendOutcome::Sent)) => {
                Some(self.shared.clock.monotonic().saturating_sub(started))
            }
            Ok(Ok(SendOutcome::Disconnected)) | Ok(Err(_)) => None,
            Err(_) => {
                debug!(peer = %self.handle.id, "ping timed out");
                None
            }
        }
    }

    /// Tear the session down locally and notify peer management.
    pub fn disconnect(&self, reason: &str) {
        let reason = FailureReason::Requested(reason.to_string());
        {
            let mut st = self.handle.state.lock();
            teardown(&mut st, &reason);
        }
        self.shared
            .directory
            .on_disconnected(&self.handle.info, &reason);
    }
}

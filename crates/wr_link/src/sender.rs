//! The packet-sender task.
//!
//! One task serves every peer: it wakes on producer signals (new
//! messages, freshly queued acks, completed handshakes) and at least
//! every `sender_poll_interval` (200 ms, the maximum coalescing
//! delay), runs the node's maintenance pass, and bumps the heartbeat
//! counter the watchdog observes. Encryption and socket writes happen
//! inside `poll` with no peer lock held across them.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::node::NodeShared;

pub(crate) fn spawn_sender_loop(shared: Arc<NodeShared>) -> JoinHandle<()> {
    let mut shutdown = shared.shutdown.subscribe();
    tokio::spawn(async move {
        info!("packet sender started");
        loop {
            shared.heartbeat.fetch_add(1, Ordering::Relaxed);
            shared.poll();

            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(shared.cfg.sender_poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("packet sender shutting down");
                        return;
                    }
                }
            }
        }
    })
}

//! Sender-task watchdog.
//!
//! The sender bumps a heartbeat counter every iteration; if the counter
//! stops advancing for the configured stall limit (3 minutes: the
//! signature of a lock-order bug, not of load), the watchdog fires the
//! node's fatal hook so the operator can restart the process.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

use crate::node::NodeShared;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) fn spawn_watchdog(shared: Arc<NodeShared>) -> JoinHandle<()> {
    let mut shutdown = shared.shutdown.subscribe();
    tokio::spawn(async move {
        let mut last_seen = shared.heartbeat.load(Ordering::Relaxed);
        let mut stalled_for = Duration::ZERO;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let current = shared.heartbeat.load(Ordering::Relaxed);
            if current != last_seen {
                last_seen = current;
                stalled_for = Duration::ZERO;
                continue;
            }
            stalled_for += CHECK_INTERVAL;
            if stalled_for >= shared.cfg.watchdog_stall_limit {
                error!(
                    stalled_secs = stalled_for.as_secs(),
                    "packet sender heartbeat stalled; firing fatal hook"
                );
                if let Some(hook) = shared.fatal_hook.lock().as_ref() {
                    hook();
                }
                stalled_for = Duration::ZERO;
            }
        }
    })
}

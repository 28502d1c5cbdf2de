//! Time sources.
//!
//! All protocol state machines take time as an argument, so tests can
//! drive them deterministically. `monotonic` is a duration since an
//! arbitrary per-clock origin; `unix_millis` is wall-clock and only used
//! for the handshake payload timestamp.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait Clock: Send + Sync + 'static {
    fn monotonic(&self) -> Duration;
    fn unix_millis(&self) -> i64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests.
pub struct ManualClock {
    inner: Mutex<(Duration, i64)>,
}

impl ManualClock {
    pub fn new() -> Self {
        // Start well away from zero so "age" arithmetic never saturates.
        Self {
            inner: Mutex::new((Duration::from_secs(1_000), 1_700_000_000_000)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += by.as_millis() as i64;
    }

    pub fn set_unix_millis(&self, millis: i64) {
        self.inner.lock().1 = millis;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.inner.lock().0
    }

    fn unix_millis(&self) -> i64 {
        self.inner.lock().1
    }
}

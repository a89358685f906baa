//! Wall clock time derived from the runtime's monotonic clock.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Maps the runtime's [`Instant`] to unix milliseconds.
///
/// Persisted deadlines need wall clock time, timers need the runtime clock. Anchoring one to the
/// other once keeps both consistent, including under a paused test runtime.
#[derive(Debug, Clone, Copy)]
pub struct UnixClock {
    anchor: Instant,
    anchor_unix_millis: u64,
}

impl UnixClock {
    /// Anchors the clock at the current time.
    pub fn new() -> Self {
        let anchor_unix_millis =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        Self { anchor: Instant::now(), anchor_unix_millis }
    }

    /// The current time in unix milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.to_unix_millis(Instant::now())
    }

    /// Converts a runtime instant to unix milliseconds.
    pub fn to_unix_millis(&self, instant: Instant) -> u64 {
        let elapsed = instant.saturating_duration_since(self.anchor).as_millis() as u64;
        self.anchor_unix_millis.saturating_add(elapsed)
    }
}

impl Default for UnixClock {
    fn default() -> Self {
        Self::new()
    }
}

//! Server reputation management

use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The type that tracks the reputation score.
pub type Reputation = i32;

/// The default reputation of a server that was never scored.
pub const DEFAULT_REPUTATION: Reputation = 0;

/// The minimal unit we're measuring reputation
pub const REPUTATION_UNIT: Reputation = -1024;

/// The reputation value below which a connected server is dropped and no longer dialed.
pub const BANNED_REPUTATION: Reputation = 50 * REPUTATION_UNIT;

/// The floor a reputation can decay to.
pub const MIN_REPUTATION: Reputation = 2 * BANNED_REPUTATION;

/// The ceiling a reputation can recover to.
pub const MAX_REPUTATION: Reputation = -BANNED_REPUTATION;

/// The reputation change to apply to a server that served a response that passed verification.
const USEFUL_RESPONSE_REPUTATION_CHANGE: Reputation = -REPUTATION_UNIT;

/// The reputation change to apply to a server that dropped the connection.
const REMOTE_DISCONNECT_REPUTATION_CHANGE: Reputation = 4 * REPUTATION_UNIT;

/// The reputation change to apply to a server that we failed to connect to.
const FAILED_TO_CONNECT_REPUTATION_CHANGE: Reputation = 25 * REPUTATION_UNIT;

/// The reputation change to apply to a server that failed to respond in time.
const TIMEOUT_REPUTATION_CHANGE: Reputation = 4 * REPUTATION_UNIT;

/// The reputation change to apply to a server whose response failed verification.
const BAD_RESPONSE_REPUTATION_CHANGE: Reputation = 16 * REPUTATION_UNIT;

/// The reputation change to apply to a server which violates protocol rules.
const BAD_PROTOCOL_REPUTATION_CHANGE: Reputation = 50 * REPUTATION_UNIT;

/// Returns `true` if the given reputation is below the [`BANNED_REPUTATION`] threshold
#[inline]
pub const fn is_banned_reputation(reputation: Reputation) -> bool {
    reputation < BANNED_REPUTATION
}

/// Various kinds of failures a server can be blamed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReputationChangeKind {
    /// Server failed to respond in time.
    Timeout,
    /// Server sent data that failed verification.
    BadResponse,
    /// Server does not adhere to protocol rules, e.g. failed the handshake.
    BadProtocol,
    /// Failed to establish a connection to the server.
    FailedToConnect,
    /// Connection dropped while a request was in flight.
    Dropped,
    /// Apply a reputation change by value
    Other(Reputation),
}

/// How the [`ReputationChangeKind`]s are weighted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationChangeWeights {
    /// Weight for a response that passed verification.
    pub useful_response: Reputation,
    /// Weight for [`ReputationChangeKind::Timeout`]
    pub timeout: Reputation,
    /// Weight for [`ReputationChangeKind::BadResponse`]
    pub bad_response: Reputation,
    /// Weight for [`ReputationChangeKind::BadProtocol`]
    pub bad_protocol: Reputation,
    /// Weight for [`ReputationChangeKind::FailedToConnect`]
    pub failed_to_connect: Reputation,
    /// Weight for [`ReputationChangeKind::Dropped`]
    pub dropped: Reputation,
}

// === impl ReputationChangeWeights ===

impl ReputationChangeWeights {
    /// Creates a new instance that doesn't change any reputation.
    pub const fn zero() -> Self {
        Self {
            useful_response: 0,
            timeout: 0,
            bad_response: 0,
            bad_protocol: 0,
            failed_to_connect: 0,
            dropped: 0,
        }
    }

    /// Returns the quantifiable change for the given [`ReputationChangeKind`] using the configured
    /// weights
    pub const fn change(&self, kind: ReputationChangeKind) -> Reputation {
        match kind {
            ReputationChangeKind::Timeout => self.timeout,
            ReputationChangeKind::BadResponse => self.bad_response,
            ReputationChangeKind::BadProtocol => self.bad_protocol,
            ReputationChangeKind::FailedToConnect => self.failed_to_connect,
            ReputationChangeKind::Dropped => self.dropped,
            ReputationChangeKind::Other(val) => val,
        }
    }
}

impl Default for ReputationChangeWeights {
    fn default() -> Self {
        Self {
            useful_response: USEFUL_RESPONSE_REPUTATION_CHANGE,
            timeout: TIMEOUT_REPUTATION_CHANGE,
            bad_response: BAD_RESPONSE_REPUTATION_CHANGE,
            bad_protocol: BAD_PROTOCOL_REPUTATION_CHANGE,
            failed_to_connect: FAILED_TO_CONNECT_REPUTATION_CHANGE,
            dropped: REMOTE_DISCONNECT_REPUTATION_CHANGE,
        }
    }
}

/// The persisted track record of a single server.
///
/// Fields can only change through the transitions below. Timestamps are milliseconds since the
/// unix epoch so records stay meaningful across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    reputation: Reputation,
    last_seen: u64,
    backoff_until: u64,
}

// === impl ReputationRecord ===

impl ReputationRecord {
    /// Number of responses that passed verification.
    pub const fn successes(&self) -> u64 {
        self.successes
    }

    /// Total number of failures.
    pub const fn failures(&self) -> u64 {
        self.failures
    }

    /// Failures since the last success.
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current reputation score.
    pub const fn reputation(&self) -> Reputation {
        self.reputation
    }

    /// When the server was last connected, in unix millis. `0` if never.
    pub const fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Until when the server must not be dialed, in unix millis.
    pub const fn backoff_until(&self) -> u64 {
        self.backoff_until
    }

    /// Returns `true` if the server was never connected nor scored.
    pub const fn is_unexplored(&self) -> bool {
        self.successes == 0 && self.failures == 0 && self.last_seen == 0
    }

    /// Returns `true` if the reputation is below the ban threshold.
    pub const fn is_banned(&self) -> bool {
        is_banned_reputation(self.reputation)
    }

    /// Returns `true` if the server is still backed off at `now`.
    pub const fn is_backed_off(&self, now: u64) -> bool {
        self.backoff_until > now
    }

    /// Records a connection to the server.
    pub fn on_seen(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Records a response that passed verification.
    ///
    /// This resets the backoff to its minimum.
    pub fn on_success(&mut self, weights: &ReputationChangeWeights, now: u64) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.backoff_until = 0;
        self.last_seen = now;
        self.apply(weights.useful_response);
    }

    /// Records a failure and returns the backoff that now applies to the server.
    ///
    /// `jitter` is a sample in `[0, 1)`, see [`BackoffConfig::jittered`].
    pub fn on_failure(
        &mut self,
        kind: ReputationChangeKind,
        weights: &ReputationChangeWeights,
        backoff: &BackoffConfig,
        jitter: f64,
        now: u64,
    ) -> Duration {
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.apply(weights.change(kind));
        let duration = backoff.jittered(self.consecutive_failures, jitter);
        self.extend_backoff(now, duration);
        duration
    }

    /// Records a disconnect and returns the backoff until the server may be dialed again.
    pub fn on_disconnect(&mut self, backoff: &BackoffConfig, jitter: f64, now: u64) -> Duration {
        self.last_seen = now;
        let duration = backoff.jittered(self.consecutive_failures, jitter);
        self.extend_backoff(now, duration);
        duration
    }

    /// Moves the reputation towards [`DEFAULT_REPUTATION`] for time spent connected.
    pub fn recover(&mut self, amount: Reputation) {
        if self.reputation < DEFAULT_REPUTATION {
            self.reputation = self.reputation.saturating_add(amount).min(DEFAULT_REPUTATION);
        }
    }

    fn apply(&mut self, change: Reputation) {
        self.reputation =
            self.reputation.saturating_add(change).clamp(MIN_REPUTATION, MAX_REPUTATION);
    }

    fn extend_backoff(&mut self, now: u64, duration: Duration) {
        let until = now.saturating_add(duration.as_millis() as u64);
        self.backoff_until = self.backoff_until.max(until);
    }
}

//! Configuration for the on-demand retrieval services.

use crate::{
    backoff::BackoffConfig,
    reputation::{ReputationChangeWeights, REPUTATION_UNIT},
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Maximum number of simultaneously connected servers.
pub const DEFAULT_MAX_PEERS: usize = 25;

/// Maximum number of concurrent outbound dials.
pub const DEFAULT_MAX_CONCURRENT_DIALS: usize = 5;

/// Maximum number of servers a single retrieval is sent to before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Errors when loading or storing a [`LightConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write the config file.
    #[error(transparent)]
    Confy(#[from] confy::ConfyError),
}

/// Configuration of all on-demand retrieval services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    /// Peer set limits.
    pub peers: PeerSetConfig,
    /// Server discovery and scoring.
    pub server_pool: ServerPoolConfig,
    /// Retrieval retry and timeout policy.
    pub retrieve: RetrieveConfig,
    /// Transaction relay limits.
    pub relay: TxRelayConfig,
}

impl LightConfig {
    /// Loads the config from the given TOML file.
    ///
    /// Writes and returns the default config if the file does not exist yet.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(confy::load_path(path.as_ref())?)
    }

    /// Stores the config as TOML at the given path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        Ok(confy::store_path(path.as_ref(), self)?)
    }
}

/// Limits of the set of connected servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSetConfig {
    /// Registration fails once this many servers are connected.
    pub max_peers: usize,
}

impl Default for PeerSetConfig {
    fn default() -> Self {
        Self { max_peers: DEFAULT_MAX_PEERS }
    }
}

/// Config type for initiating a `ServerPool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPoolConfig {
    /// Maximum number of connected servers the pool dials up to.
    pub max_connected: usize,
    /// Maximum number of dials in progress at any time.
    pub max_concurrent_dials: usize,
    /// How often to check for free slots and better candidates.
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    /// How long to wait before reopening a failed or exhausted discovery source.
    #[serde(with = "humantime_serde")]
    pub discovery_retry_interval: Duration,
    /// Reconnect backoff policy.
    pub backoff: BackoffConfig,
    /// How to weigh reputation changes.
    pub reputation_weights: ReputationChangeWeights,
    /// A candidate must beat the worst connected server by more than this to replace it.
    pub replacement_margin: i32,
    /// Every n-th dial prefers a server that was never tried before. `0` disables exploration.
    pub explore_ratio: u32,
    /// Reputation regained per second while connected, up to the default reputation.
    pub recovery_per_sec: i32,
}

impl ServerPoolConfig {
    /// Maximum number of connected servers.
    pub const fn with_max_connected(mut self, max_connected: usize) -> Self {
        self.max_connected = max_connected;
        self
    }

    /// Maximum number of concurrent dials.
    pub const fn with_max_concurrent_dials(mut self, max_concurrent_dials: usize) -> Self {
        self.max_concurrent_dials = max_concurrent_dials;
        self
    }

    /// Sets the backoff policy.
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the refill interval.
    pub const fn with_refill_interval(mut self, refill_interval: Duration) -> Self {
        self.refill_interval = refill_interval;
        self
    }

    /// Returns a config suited for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn test() -> Self {
        Self {
            refill_interval: Duration::from_millis(100),
            discovery_retry_interval: Duration::from_millis(200),
            backoff: BackoffConfig::test(),
            ..Default::default()
        }
    }
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            max_connected: DEFAULT_MAX_PEERS,
            max_concurrent_dials: DEFAULT_MAX_CONCURRENT_DIALS,
            refill_interval: Duration::from_secs(1),
            discovery_retry_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            reputation_weights: ReputationChangeWeights::default(),
            replacement_margin: 2 * -REPUTATION_UNIT,
            explore_ratio: 2,
            recovery_per_sec: 1,
        }
    }
}

/// Retry and timeout policy of the retrieve manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    /// Maximum number of distinct servers tried for a single retrieval.
    pub max_attempts: u32,
    /// Deadline of a retrieval if the caller did not pick one.
    #[serde(with = "humantime_serde")]
    pub default_deadline: Duration,
    /// Lower bound of the per-server response timeout.
    #[serde(with = "humantime_serde")]
    pub min_request_timeout: Duration,
    /// Upper bound of the per-server response timeout.
    #[serde(with = "humantime_serde")]
    pub max_request_timeout: Duration,
    /// Amount of round trips before a server is considered timed out.
    pub timeout_scaling: u32,
}

impl RetrieveConfig {
    /// Sets the maximum number of attempts.
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the default deadline.
    pub const fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Returns the response timeout for a server with the given round trip estimate.
    ///
    /// Slow servers get proportionally more time but never less than
    /// [`RetrieveConfig::min_request_timeout`] or more than
    /// [`RetrieveConfig::max_request_timeout`].
    pub fn request_timeout(&self, rtt: Duration) -> Duration {
        rtt.saturating_mul(self.timeout_scaling)
            .clamp(self.min_request_timeout, self.max_request_timeout.max(self.min_request_timeout))
    }
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_deadline: Duration::from_secs(10),
            min_request_timeout: Duration::from_secs(1),
            max_request_timeout: Duration::from_secs(8),
            timeout_scaling: 3,
        }
    }
}

/// Limits of the transaction relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxRelayConfig {
    /// Maximum number of unconfirmed transactions kept for rebroadcast.
    pub max_pending: usize,
    /// Maximum number of transactions per message.
    pub max_batch: usize,
}

impl Default for TxRelayConfig {
    fn default() -> Self {
        Self { max_pending: 4096, max_batch: 64 }
    }
}

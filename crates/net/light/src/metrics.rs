use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Metrics for the request distributor.
#[derive(Metrics)]
#[metrics(scope = "light.distributor")]
pub(crate) struct DistributorMetrics {
    /// Number of requests waiting for a server
    pub(crate) queued_requests: Gauge,
    /// Number of requests assigned to a server
    pub(crate) in_flight_requests: Gauge,
    /// Total number of requests handed to a server
    pub(crate) dispatched_requests: Counter,
    /// Total number of requests requeued because their server disconnected
    pub(crate) requeued_requests: Counter,
    /// Total number of requests dropped because no server could serve them
    pub(crate) dropped_requests: Counter,
}

/// Metrics for the retrieve manager.
#[derive(Metrics)]
#[metrics(scope = "light.retrieve")]
pub(crate) struct RetrieveMetrics {
    /// Number of retrievals in progress
    pub(crate) active_retrievals: Gauge,
    /// Total number of retrievals that returned a verified value
    pub(crate) successful_retrievals: Counter,
    /// Total number of retrievals that ran out of servers or time
    pub(crate) exhausted_retrievals: Counter,
    /// Total number of attempts that timed out
    pub(crate) timeouts: Counter,
    /// Total number of responses that failed verification
    pub(crate) verification_failures: Counter,
}

/// Metrics for the server pool.
#[derive(Metrics)]
#[metrics(scope = "light.server_pool")]
pub(crate) struct ServerPoolMetrics {
    /// Number of servers the pool knows about
    pub(crate) known_servers: Gauge,
    /// Number of connected servers
    pub(crate) connected_servers: Gauge,
    /// Number of dials in progress
    pub(crate) dialing_servers: Gauge,
    /// Total number of servers disconnected to make room for better candidates
    pub(crate) replaced_servers: Counter,
    /// Total number of failed dials
    pub(crate) failed_dials: Counter,
}

/// Metrics for the transaction relay.
#[derive(Metrics)]
#[metrics(scope = "light.relay")]
pub(crate) struct TxRelayMetrics {
    /// Number of transactions waiting to be mined
    pub(crate) pending_transactions: Gauge,
    /// Total number of transaction messages sent to servers
    pub(crate) sent_messages: Counter,
    /// Seconds a transaction stayed pending before it was mined, discarded or evicted
    pub(crate) pending_duration: Histogram,
}

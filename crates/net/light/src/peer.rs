//! A connected light server.

use crate::error::PeerSendError;
use alloy_primitives::Bytes;
use parking_lot::RwLock;
use reth_light_types::{Capability, HeadInfo, PeerId, RequestKind, ServeCapacity};
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// How much a new round trip measurement affects the estimate (X percent)
const SAMPLE_IMPACT: f64 = 0.1;

/// Identifier of a request, unique for the lifetime of the process.
pub type RequestId = u64;

/// An encoded request as handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightRequest {
    /// What is requested.
    pub kind: RequestKind,
    /// The encoded request body.
    pub payload: Bytes,
}

/// The session level half of a server connection.
///
/// Encoding, flow control and the handshake live behind this trait. Responses are handed back to
/// the [`RetrieveHandle`](crate::RetrieveHandle) by whoever reads the connection.
pub trait LightPeerConnection: fmt::Debug + Send + Sync + 'static {
    /// Sends a request to the server.
    fn send_request(&self, id: RequestId, request: &LightRequest) -> Result<(), PeerSendError>;

    /// Sends transactions for broadcast to the server.
    fn send_transactions(&self, txs: &[Bytes]) -> Result<(), PeerSendError>;
}

/// A server with an established session.
///
/// Instances are never reused: a reconnect produces a new [`LightPeer`].
#[derive(Debug)]
pub struct LightPeer {
    id: PeerId,
    addr: SocketAddr,
    version: u32,
    capacity: ServeCapacity,
    head: RwLock<HeadInfo>,
    /// Smoothed round trip estimate in micros.
    rtt: AtomicU64,
    /// Requests currently assigned to this server, only written by the distributor.
    outstanding: AtomicUsize,
    alive: AtomicBool,
    conn: Arc<dyn LightPeerConnection>,
}

// === impl LightPeer ===

impl LightPeer {
    /// Creates a new peer from a finished handshake.
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        version: u32,
        capacity: ServeCapacity,
        head: HeadInfo,
        rtt: Duration,
        conn: Arc<dyn LightPeerConnection>,
    ) -> Self {
        Self {
            id,
            addr,
            version,
            capacity,
            head: RwLock::new(head),
            rtt: AtomicU64::new(rtt.as_micros() as u64),
            outstanding: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            conn,
        }
    }

    /// The identity of the server.
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// The remote address of the session.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The negotiated protocol version.
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// The capacity class the server declared.
    pub const fn capacity(&self) -> ServeCapacity {
        self.capacity
    }

    /// The latest announced head.
    pub fn head(&self) -> HeadInfo {
        *self.head.read()
    }

    /// Updates the head after an announcement.
    pub fn set_head(&self, head: HeadInfo) {
        *self.head.write() = head;
    }

    /// The current round trip estimate.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt.load(Ordering::Relaxed))
    }

    /// Folds a new round trip measurement into the estimate.
    pub fn update_rtt(&self, sample: Duration) {
        let current = self.rtt();
        let rtt = smoothed_rtt(current, sample);
        self.rtt.store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    /// Number of requests currently assigned to this server.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_outstanding(&self) {
        let _ = self.outstanding.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    /// Returns `true` if another request fits into the server's declared capacity.
    pub fn has_capacity(&self) -> bool {
        self.outstanding() < self.capacity.max_in_flight()
    }

    /// Returns `true` until the server is removed from the peer set.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Returns `true` if the server speaks a protocol version that supports the request kind.
    pub fn serves(&self, kind: RequestKind) -> bool {
        self.is_alive() && self.capacity.is_serving() && self.version >= kind.min_protocol_version()
    }

    /// Returns `true` if the server is able to serve requests with the given requirements.
    pub fn satisfies(&self, capability: &Capability) -> bool {
        self.serves(capability.kind) && self.head().number >= capability.min_head
    }

    /// Hands a request to the connection.
    pub fn send_request(&self, id: RequestId, request: &LightRequest) -> Result<(), PeerSendError> {
        if !self.is_alive() {
            return Err(PeerSendError::Disconnected)
        }
        self.conn.send_request(id, request)
    }

    /// Hands transactions to the connection.
    pub fn send_transactions(&self, txs: &[Bytes]) -> Result<(), PeerSendError> {
        if !self.is_alive() {
            return Err(PeerSendError::Disconnected)
        }
        self.conn.send_transactions(txs)
    }
}

/// Calculates a new round trip estimate, dampening sudden changes by taking a weighted mean of the
/// old and new values.
#[inline]
fn smoothed_rtt(current: Duration, sample: Duration) -> Duration {
    current.mul_f64(1.0 - SAMPLE_IMPACT) + sample.mul_f64(SAMPLE_IMPACT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_peer, MockConnection};

    #[test]
    fn rtt_smoothing_sanity() {
        let rtt = Duration::from_millis(100);
        assert_eq!(smoothed_rtt(rtt, rtt), rtt);
        assert!(smoothed_rtt(rtt, rtt / 2) < rtt);
        assert!(smoothed_rtt(rtt, rtt / 2) > rtt / 2);
        assert!(smoothed_rtt(rtt, rtt * 2) > rtt);
        assert!(smoothed_rtt(rtt, rtt * 2) < rtt * 2);
    }

    #[test]
    fn serves_respects_version_and_liveness() {
        let (conn, _rx) = MockConnection::new();
        let peer = test_peer(PeerId::random(), conn);
        assert!(peer.serves(RequestKind::TxStatus));
        assert!(peer.satisfies(&Capability::new(RequestKind::Receipts)));
        assert!(!peer.satisfies(&Capability::new(RequestKind::Receipts).with_min_head(u64::MAX)));

        peer.mark_disconnected();
        assert!(!peer.serves(RequestKind::BlockHeaders));
        let request = LightRequest { kind: RequestKind::BlockHeaders, payload: Bytes::new() };
        assert_eq!(peer.send_request(1, &request), Err(PeerSendError::Disconnected));
    }

    #[test]
    fn outstanding_never_underflows() {
        let (conn, _rx) = MockConnection::new();
        let peer = test_peer(PeerId::random(), conn);
        peer.dec_outstanding();
        assert_eq!(peer.outstanding(), 0);
        peer.inc_outstanding();
        assert_eq!(peer.outstanding(), 1);
        assert!(peer.has_capacity());
    }
}

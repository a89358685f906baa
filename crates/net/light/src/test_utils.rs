//! Helpers for testing the retrieval services without a network.

use crate::{
    error::PeerSendError,
    peer::{LightPeer, LightPeerConnection, LightRequest, RequestId},
};
use alloy_primitives::{Bytes, B256};
use reth_light_types::{HeadInfo, PeerId, ServeCapacity};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Head block number announced by [`test_peer`].
pub const TEST_HEAD: u64 = 1_000;

/// A message handed to a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    /// A retrieval request.
    Request {
        /// Identifier to answer with.
        id: RequestId,
        /// The request itself.
        request: LightRequest,
    },
    /// A transaction broadcast.
    Transactions(Vec<Bytes>),
}

/// A connection that records everything sent through it.
#[derive(Debug)]
pub struct MockConnection {
    sent: mpsc::UnboundedSender<SentMessage>,
    failing: AtomicBool,
}

impl MockConnection {
    /// Returns a new connection and the receiving end of everything sent through it.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SentMessage>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { sent, failing: AtomicBool::new(false) }), rx)
    }

    /// Makes all further sends fail with [`PeerSendError::Other`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn record(&self, msg: SentMessage) -> Result<(), PeerSendError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PeerSendError::Other("mock send failure".to_string()))
        }
        Ok(self.sent.send(msg)?)
    }
}

impl LightPeerConnection for MockConnection {
    fn send_request(&self, id: RequestId, request: &LightRequest) -> Result<(), PeerSendError> {
        self.record(SentMessage::Request { id, request: request.clone() })
    }

    fn send_transactions(&self, txs: &[Bytes]) -> Result<(), PeerSendError> {
        self.record(SentMessage::Transactions(txs.to_vec()))
    }
}

/// Returns a peer speaking the latest protocol version with a round trip estimate of 100ms.
pub fn test_peer(id: PeerId, conn: Arc<MockConnection>) -> LightPeer {
    test_peer_with_rtt(id, conn, Duration::from_millis(100))
}

/// Returns a peer speaking the latest protocol version with the given round trip estimate.
pub fn test_peer_with_rtt(id: PeerId, conn: Arc<MockConnection>, rtt: Duration) -> LightPeer {
    LightPeer::new(
        id,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30303),
        reth_light_types::peer::TX_STATUS_PROTOCOL_VERSION,
        ServeCapacity::Standard,
        HeadInfo { number: TEST_HEAD, hash: B256::ZERO },
        rtt,
        conn,
    )
}

/// Initializes a tracing subscriber for tests.
///
/// The filter is configurable via `RUST_LOG`.
///
/// # Note
///
/// The subscriber will silently fail if it could not be installed.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

//! Possible errors when retrieving data from light servers.

use reth_light_types::PeerId;
use tokio::sync::{mpsc, oneshot};

/// Result alias for the outcome of a retrieval.
pub type RetrieveResult<T> = Result<T, RetrieveError>;

/// Errors when registering a server in the [`PeerSet`](crate::PeerSet).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerSetError {
    /// A server with the same identity is already registered.
    #[error("peer {0} is already registered")]
    DuplicateIdentity(PeerId),
    /// The set was shut down.
    #[error("peer set closed")]
    Closed,
    /// The configured maximum of connected servers is reached.
    #[error("peer set is full ({0} peers)")]
    Full(usize),
}

/// Errors returned by a connection when handing it a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerSendError {
    /// The server is no longer connected.
    #[error("peer disconnected")]
    Disconnected,
    /// The session task is gone.
    #[error("closed channel to the peer")]
    ChannelClosed,
    /// Any other connection level failure.
    #[error("{0}")]
    Other(String),
}

impl<T> From<mpsc::error::SendError<T>> for PeerSendError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

/// Error returned by a verifier when a response does not prove what was requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("verification failed: {0}")]
pub struct VerifyError(pub String);

impl VerifyError {
    /// Creates a new error with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Terminal errors of a retrieval as observed by the caller.
///
/// Failures of individual servers never surface here, they are retried with other servers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrieveError {
    /// Every eligible server failed, none was available, or the retry ceiling was hit.
    #[error("retrieval exhausted after {attempts} attempts")]
    RetrievalExhausted {
        /// Number of servers the request was sent to.
        attempts: u32,
    },
    /// The retrieval services are shutting down.
    #[error("retrieval services shut down")]
    Shutdown,
    /// The caller canceled the retrieval.
    #[error("retrieval canceled")]
    Canceled,
}

impl From<oneshot::error::RecvError> for RetrieveError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::Shutdown
    }
}

/// Why a single attempt at one server failed.
///
/// These drive reputation changes and retries and never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum AttemptError {
    /// No server could take the request.
    #[error("no eligible peer available")]
    PeerUnavailable,
    /// The response did not pass the verifier.
    #[error(transparent)]
    VerificationFailed(#[from] VerifyError),
    /// No response before the server's timeout.
    #[error("request timed out")]
    Timeout,
    /// The server disconnected while the request was in flight.
    #[error("peer dropped while serving the request")]
    PeerDropped,
}

//! On-demand retrieval of proof-backed chain data from light servers.
//!
//! A light client holds no state, it fetches what it needs from servers and verifies every
//! response against a root it already trusts. This crate contains the services doing so:
//!
//! - [`PeerSet`]: the registry of connected servers, shared by all services.
//! - [`ServerPool`]: discovers, scores and dials servers, keeping the connected set filled with the
//!   best known candidates.
//! - [`RequestDistributor`]: assigns queued requests to the least loaded eligible server.
//! - [`RetrieveManager`]: verifies responses, retries failed attempts with other servers and
//!   reports server behavior to the pool.
//! - [`TxRelay`]: broadcasts local transactions until they are mined.
//!
//! [`LightOdr`] wires them together.
//!
//! ## Feature Flags
//!
//! - `test-utils`: Mock connections and peers for tests.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/paradigmxyz/reth/main/assets/reth-docs.png",
    html_favicon_url = "https://avatars0.githubusercontent.com/u/97369466?s=256",
    issue_tracker_base_url = "https://github.com/paradigmxyz/reth/issues/"
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod clock;
pub mod distributor;
pub mod error;
mod metrics;
pub mod odr;
pub mod peer;
pub mod peer_set;
pub mod requests;
pub mod retrieve;
pub mod server_pool;
pub mod shutdown;
pub mod txrelay;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use distributor::{DistEvent, DistRequest, DistributorHandle, RequestDistributor};
pub use error::{PeerSendError, PeerSetError, RetrieveError, RetrieveResult, VerifyError};
pub use odr::{LightOdr, LightOdrServices};
pub use peer::{LightPeer, LightPeerConnection, LightRequest, RequestId};
pub use peer_set::{PeerSet, PeerSetEvent};
pub use requests::{OdrRequest, ProofRequest, Verifier};
pub use retrieve::{PendingRetrieval, RetrieveHandle, RetrieveManager};
pub use server_pool::{
    DiscoveryError, DiscoverySource, FileReputationStore, MemoryReputationStore, PoolAction,
    PoolDisconnectReason, ReputationStore, ServerInfo, ServerPool, ServerPoolHandle, ServerState,
    StaticDiscovery,
};
pub use shutdown::{signal, Shutdown, Signal};
pub use txrelay::{TxRelay, TxRelayHandle};

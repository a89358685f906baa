//! Commonly used types for the light client on-demand retrieval core.
//!
//! This crate holds plain data shared by the peer set, server pool, request distributor,
//! retrieve manager and transaction relay: identities, request kinds, reputation bookkeeping,
//! the backoff policy and all configuration.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod backoff;
pub mod config;
pub mod peer;
pub mod reputation;

pub use backoff::BackoffConfig;
pub use config::{
    ConfigError, LightConfig, PeerSetConfig, RetrieveConfig, ServerPoolConfig, TxRelayConfig,
};
pub use peer::{Capability, HeadInfo, NodeRecord, PeerId, RequestKind, ServeCapacity, TxHash};
pub use reputation::{
    is_banned_reputation, Reputation, ReputationChangeKind, ReputationChangeWeights,
    ReputationRecord, BANNED_REPUTATION, DEFAULT_REPUTATION, MAX_REPUTATION, MIN_REPUTATION,
};

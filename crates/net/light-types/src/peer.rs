//! Types describing remote servers and what they can serve.

use alloy_primitives::{B256, B512};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// Identifier for a remote node: the 64 byte uncompressed public key.
pub type PeerId = B512;

/// Hash of a transaction handed to the relay.
pub type TxHash = B256;

/// The lowest protocol version this client is able to talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// The protocol version that added transaction status queries.
pub const TX_STATUS_PROTOCOL_VERSION: u32 = 3;

/// Where a server can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The public key of the node.
    pub id: PeerId,
    /// IP address of the node.
    pub address: IpAddr,
    /// TCP port of the light protocol listener.
    pub tcp_port: u16,
}

impl NodeRecord {
    /// Creates a new record from a socket address and node id.
    pub fn new(addr: SocketAddr, id: PeerId) -> Self {
        Self { id, address: addr.ip(), tcp_port: addr.port() }
    }

    /// The TCP socket address of this node.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enode://{:x}@{}", self.id, self.tcp_addr())
    }
}

/// The serving capacity a server declared during the handshake.
///
/// This bounds how many requests may be outstanding at that server at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServeCapacity {
    /// The server does not serve light clients at all, e.g. it only announces heads.
    None,
    /// Small buffer, a couple of requests at a time.
    Low,
    /// The common case.
    #[default]
    Standard,
    /// Dedicated light servers with large request buffers.
    High,
}

impl ServeCapacity {
    /// Returns how many requests may be in flight at a server of this class.
    pub const fn max_in_flight(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Low => 2,
            Self::Standard => 8,
            Self::High => 32,
        }
    }

    /// Returns `true` if the server accepts any requests.
    pub const fn is_serving(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// The families of requests a light client sends to servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Block headers by hash or number.
    BlockHeaders,
    /// Block bodies by hash.
    BlockBodies,
    /// Receipts of a block.
    Receipts,
    /// Merkle proof of an account or storage slot.
    AccountProof,
    /// Contract bytecode by code hash.
    ContractCode,
    /// Proof against the canonical-hash index.
    ChtProof,
    /// Proof against the bloom-filter index.
    BloomTrieProof,
    /// Inclusion status of transactions.
    TxStatus,
    /// Broadcast of local transactions.
    SendTransactions,
}

impl RequestKind {
    /// The first protocol version that supports this kind of request.
    pub const fn min_protocol_version(&self) -> u32 {
        match self {
            Self::TxStatus => TX_STATUS_PROTOCOL_VERSION,
            _ => MIN_PROTOCOL_VERSION,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BlockHeaders => "headers",
            Self::BlockBodies => "bodies",
            Self::Receipts => "receipts",
            Self::AccountProof => "account_proof",
            Self::ContractCode => "code",
            Self::ChtProof => "cht_proof",
            Self::BloomTrieProof => "bloom_trie_proof",
            Self::TxStatus => "tx_status",
            Self::SendTransactions => "send_txs",
        };
        f.write_str(name)
    }
}

/// The latest head a server announced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    /// Block number of the head.
    pub number: u64,
    /// Block hash of the head.
    pub hash: B256,
}

/// What a request needs from a server in order to be sent there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// The kind of request, determines the required protocol version.
    pub kind: RequestKind,
    /// The server must have announced a head at least this high.
    pub min_head: u64,
}

impl Capability {
    /// A capability with no head requirement.
    pub const fn new(kind: RequestKind) -> Self {
        Self { kind, min_head: 0 }
    }

    /// Requires the server to have indexed data up to the given block.
    pub const fn with_min_head(mut self, min_head: u64) -> Self {
        self.min_head = min_head;
        self
    }
}

//! Sources of candidate servers.

use futures::stream::{self, BoxStream, StreamExt};
use reth_light_types::NodeRecord;
use std::fmt;

/// A stream of discovered servers.
pub type DiscoveryStream = BoxStream<'static, Result<NodeRecord, DiscoveryError>>;

/// Errors of a [`DiscoverySource`].
///
/// These are never fatal, the server pool reopens the source after a while.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The source can not be reached right now.
    #[error("discovery source unavailable: {0}")]
    Unavailable(String),
}

/// Something that yields candidate servers, e.g. a DNS tree or a discovery table.
pub trait DiscoverySource: fmt::Debug + Send + 'static {
    /// Opens a new stream of candidates.
    ///
    /// The server pool calls this again once the previous stream failed or finished.
    fn open(&mut self) -> Result<DiscoveryStream, DiscoveryError>;
}

/// A fixed list of servers, e.g. the bootnodes of a network.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    nodes: Vec<NodeRecord>,
}

impl StaticDiscovery {
    /// Creates a source that yields the given servers.
    pub fn new(nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        Self { nodes: nodes.into_iter().collect() }
    }
}

impl DiscoverySource for StaticDiscovery {
    fn open(&mut self) -> Result<DiscoveryStream, DiscoveryError> {
        Ok(stream::iter(self.nodes.clone().into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reth_light_types::PeerId;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn static_discovery_reopens() {
        let node = NodeRecord::new(SocketAddr::from(([127, 0, 0, 1], 30303)), PeerId::random());
        let mut source = StaticDiscovery::new([node]);
        for _ in 0..2 {
            let nodes = source.open().unwrap().collect::<Vec<_>>().await;
            assert_eq!(nodes, vec![Ok(node)]);
        }
    }
}

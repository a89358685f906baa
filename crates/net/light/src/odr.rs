//! Wiring of all retrieval services.

use crate::{
    distributor::{DistributorHandle, RequestDistributor},
    peer_set::PeerSet,
    retrieve::{RetrieveHandle, RetrieveManager},
    server_pool::{DiscoverySource, ReputationStore, ServerPool, ServerPoolHandle},
    shutdown::Shutdown,
    txrelay::{TxRelay, TxRelayHandle},
};
use reth_light_types::LightConfig;
use tracing::debug;

/// Handles to the running retrieval services.
///
/// The network layer registers established sessions in [`LightOdr::peers`] and hands responses to
/// [`LightOdr::retrieve`], everything else talks to the handles.
#[derive(Debug, Clone)]
pub struct LightOdr {
    peers: PeerSet,
    distributor: DistributorHandle,
    pool: ServerPoolHandle,
    retrieve: RetrieveHandle,
    relay: TxRelayHandle,
}

// === impl LightOdr ===

impl LightOdr {
    /// Creates all services in dependency order.
    ///
    /// Nothing runs until [`LightOdrServices::spawn`] is called.
    pub fn new(
        config: LightConfig,
        store: Box<dyn ReputationStore>,
        discovery: Box<dyn DiscoverySource>,
        shutdown: Shutdown,
    ) -> (Self, LightOdrServices) {
        let LightConfig { peers: peers_config, mut server_pool, retrieve, relay } = config;
        // dialing past the peer set limit only produces rejected registrations
        server_pool.max_connected = server_pool.max_connected.min(peers_config.max_peers);

        let peers = PeerSet::new(peers_config);
        let distributor = RequestDistributor::new(peers.clone(), shutdown.clone());
        let pool = ServerPool::new(server_pool, &peers, store, discovery, shutdown.clone());
        let retriever =
            RetrieveManager::new(retrieve, distributor.handle(), pool.handle(), shutdown.clone());
        let relay = TxRelay::new(relay, peers.clone(), shutdown.clone());

        let odr = Self {
            peers: peers.clone(),
            distributor: distributor.handle(),
            pool: pool.handle(),
            retrieve: retriever.handle(),
            relay: relay.handle(),
        };
        let services = LightOdrServices { peers, distributor, pool, retriever, relay, shutdown };
        (odr, services)
    }

    /// The set of connected servers.
    pub const fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Handle to the request distributor.
    pub const fn distributor(&self) -> &DistributorHandle {
        &self.distributor
    }

    /// Handle to the server pool.
    pub const fn pool(&self) -> &ServerPoolHandle {
        &self.pool
    }

    /// Handle to start retrievals and deliver responses.
    pub const fn retrieve(&self) -> &RetrieveHandle {
        &self.retrieve
    }

    /// Handle to the transaction relay.
    pub const fn relay(&self) -> &TxRelayHandle {
        &self.relay
    }
}

/// The services created by [`LightOdr::new`], not yet running.
#[derive(Debug)]
#[must_use = "services do nothing unless spawned"]
pub struct LightOdrServices {
    peers: PeerSet,
    distributor: RequestDistributor,
    pool: ServerPool,
    retriever: RetrieveManager,
    relay: TxRelay,
    shutdown: Shutdown,
}

impl LightOdrServices {
    /// Spawns the distributor, the retrieve manager and the relay on the current tokio runtime.
    ///
    /// Returns the server pool, whose [`PoolAction`](crate::PoolAction)s the network layer must
    /// execute. The peer set is closed once the shutdown signal fired.
    pub fn spawn(self) -> ServerPool {
        let Self { peers, distributor, pool, retriever, relay, shutdown } = self;
        tokio::spawn(distributor);
        tokio::spawn(retriever);
        tokio::spawn(relay);
        tokio::spawn(async move {
            shutdown.await;
            debug!(target: "net::light::peers", "shutdown signal received, closing peer set");
            peers.close();
        });
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        server_pool::{MemoryReputationStore, PoolAction, StaticDiscovery},
        shutdown::signal,
        test_utils::{test_peer, MockConnection},
    };
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use reth_light_types::{NodeRecord, PeerId, PeerSetConfig, ServerPoolConfig};
    use std::{net::SocketAddr, time::Duration};

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_peer_set_and_pool() {
        let (signal, shutdown) = signal();
        let (odr, services) = LightOdr::new(
            LightConfig::default(),
            Box::new(MemoryReputationStore::default()),
            Box::new(StaticDiscovery::default()),
            shutdown,
        );
        let mut pool = services.spawn();

        let (conn, _sent) = MockConnection::new();
        let peer = odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();

        signal.fire();
        assert!(pool.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(odr.peers().is_closed());
        assert!(!peer.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_dials_within_peer_limit() {
        let nodes = (0..3u16).map(|i| {
            NodeRecord::new(SocketAddr::from(([127, 0, 0, 1], 30303 + i)), PeerId::random())
        });
        let config = LightConfig {
            peers: PeerSetConfig { max_peers: 1 },
            server_pool: ServerPoolConfig::test().with_max_connected(3),
            ..Default::default()
        };
        let (_signal, shutdown) = signal();
        let (_odr, services) = LightOdr::new(
            config,
            Box::new(MemoryReputationStore::default()),
            Box::new(StaticDiscovery::new(nodes)),
            shutdown,
        );
        let mut pool = services.spawn();

        assert_matches!(pool.next().await, Some(PoolAction::Connect { .. }));
        assert!(tokio::time::timeout(Duration::from_secs(1), pool.next()).await.is_err());
    }
}

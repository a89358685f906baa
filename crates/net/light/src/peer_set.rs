//! The set of connected light servers.

use crate::{error::PeerSetError, peer::LightPeer};
use parking_lot::RwLock;
use reth_light_types::{PeerId, PeerSetConfig};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// Membership changes of the [`PeerSet`].
#[derive(Debug, Clone)]
pub enum PeerSetEvent {
    /// A server finished its handshake and was registered.
    Added(Arc<LightPeer>),
    /// A server was removed, it will not serve any further requests.
    Removed(PeerId),
}

/// Registry of connected servers, shared between all retrieval services.
///
/// Reads take a shared lock, registration and removal an exclusive one. Membership events are
/// published while holding the write lock, so every subscriber observes the same order of changes.
#[derive(Debug, Clone)]
pub struct PeerSet {
    inner: Arc<RwLock<PeerSetInner>>,
}

#[derive(Debug)]
struct PeerSetInner {
    peers: HashMap<PeerId, Arc<LightPeer>>,
    max_peers: usize,
    closed: bool,
    listeners: Vec<mpsc::UnboundedSender<PeerSetEvent>>,
}

impl PeerSetInner {
    fn notify(&mut self, event: PeerSetEvent) {
        self.listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }
}

// === impl PeerSet ===

impl PeerSet {
    /// Creates an empty set with the given limits.
    pub fn new(config: PeerSetConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PeerSetInner {
                peers: HashMap::new(),
                max_peers: config.max_peers,
                closed: false,
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers a server after a successful handshake.
    pub fn register(&self, peer: LightPeer) -> Result<Arc<LightPeer>, PeerSetError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(PeerSetError::Closed)
        }
        let id = peer.id();
        if inner.peers.contains_key(&id) {
            return Err(PeerSetError::DuplicateIdentity(id))
        }
        if inner.peers.len() >= inner.max_peers {
            return Err(PeerSetError::Full(inner.max_peers))
        }

        trace!(target: "net::light::peers", ?id, addr=%peer.addr(), "registered peer");
        let peer = Arc::new(peer);
        inner.peers.insert(id, Arc::clone(&peer));
        inner.notify(PeerSetEvent::Added(Arc::clone(&peer)));
        Ok(peer)
    }

    /// Removes the server from the set.
    ///
    /// Removing an unknown server is a noop.
    pub fn unregister(&self, id: &PeerId) -> Option<Arc<LightPeer>> {
        let mut inner = self.inner.write();
        let peer = inner.peers.remove(id)?;
        peer.mark_disconnected();
        trace!(target: "net::light::peers", ?id, "unregistered peer");
        inner.notify(PeerSetEvent::Removed(*id));
        Some(peer)
    }

    /// Returns the registered server with the given identity.
    pub fn get(&self, id: &PeerId) -> Option<Arc<LightPeer>> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Returns `true` if a server with the given identity is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Returns `true` if no server is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Returns `true` once the set was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Returns the least loaded server accepted by the filter.
    ///
    /// Ties in the number of outstanding requests are broken by the lower round trip estimate.
    pub fn best<F>(&self, mut filter: F) -> Option<Arc<LightPeer>>
    where
        F: FnMut(&LightPeer) -> bool,
    {
        let inner = self.inner.read();
        inner
            .peers
            .values()
            .filter(|peer| filter(peer))
            .min_by(|a, b| {
                a.outstanding().cmp(&b.outstanding()).then_with(|| a.rtt().cmp(&b.rtt()))
            })
            .cloned()
    }

    /// Returns a snapshot of all registered servers.
    pub fn peers(&self) -> Vec<Arc<LightPeer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Calls `f` for every server registered at the time of the call.
    ///
    /// The walk runs over a snapshot without holding the lock, so `f` may register or unregister
    /// servers. Such changes are not observed by the walk.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(Arc<LightPeer>),
    {
        self.peers().into_iter().for_each(f)
    }

    /// Returns a new stream of membership changes.
    ///
    /// The stream starts empty, use [`PeerSet::peers`] to learn about servers registered before.
    pub fn subscribe(&self) -> UnboundedReceiverStream<PeerSetEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().listeners.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Removes all servers and rejects further registrations.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return
        }
        inner.closed = true;
        let ids = inner.peers.keys().copied().collect::<Vec<_>>();
        debug!(target: "net::light::peers", peers = ids.len(), "closing peer set");
        for id in ids {
            if let Some(peer) = inner.peers.remove(&id) {
                peer.mark_disconnected();
                inner.notify(PeerSetEvent::Removed(id));
            }
        }
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new(PeerSetConfig::default())
    }
}

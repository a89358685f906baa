//! Decides which servers to dial and keeps their track record.

use crate::{
    clock::UnixClock,
    metrics::ServerPoolMetrics,
    peer_set::{PeerSet, PeerSetEvent},
    shutdown::Shutdown,
};
use futures::{FutureExt, Stream, StreamExt};
use rand::Rng;
use reth_light_types::{
    NodeRecord, PeerId, Reputation, ReputationChangeKind, ReputationRecord, ServerPoolConfig,
};
use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, Interval, Sleep},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

mod discovery;
mod store;

pub use discovery::{DiscoveryError, DiscoverySource, DiscoveryStream, StaticDiscovery};
pub use store::{
    FileReputationStore, MemoryReputationStore, ReputationStore, StoreError, StoredServer,
};

/// Where a known server is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Known, never dialed by this pool.
    Unknown,
    /// A dial is in progress.
    Dialing,
    /// Connected, no request outcome yet.
    Connected,
    /// Connected and its last request succeeded.
    Useful,
    /// Connected and its last request failed.
    Useless,
    /// Not connected anymore, may be dialed again once its backoff passed.
    Disconnected,
}

impl ServerState {
    /// Returns `true` if the server is in the [`PeerSet`].
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Useful | Self::Useless)
    }

    /// Returns `true` if the server may be dialed.
    pub const fn is_unconnected(&self) -> bool {
        matches!(self, Self::Unknown | Self::Disconnected)
    }
}

/// A server known to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Where the server can be reached.
    pub record: NodeRecord,
    /// The persisted track record.
    pub reputation: ReputationRecord,
    /// Connection state.
    pub state: ServerState,
    /// Round trip of the last successful request.
    pub last_rtt: Option<Duration>,
}

impl ServerInfo {
    fn new(record: NodeRecord, reputation: ReputationRecord) -> Self {
        Self { record, reputation, state: ServerState::Unknown, last_rtt: None }
    }

    const fn score(&self) -> Reputation {
        self.reputation.reputation()
    }

    fn stored(&self) -> StoredServer {
        StoredServer { record: self.record, reputation: self.reputation.clone() }
    }
}

/// Why the pool wants a server disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDisconnectReason {
    /// The slot goes to a better candidate.
    Replaced,
    /// The server's reputation fell below the ban threshold.
    Banned,
}

/// Actions the pool wants the network to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAction {
    /// Dial the server.
    ///
    /// The outcome is reported through the [`PeerSet`] on success, or
    /// [`ServerPoolHandle::on_dial_failure`].
    Connect {
        /// The server to dial.
        peer_id: PeerId,
        /// Where to dial it.
        remote_addr: SocketAddr,
    },
    /// Disconnect the server.
    Disconnect {
        /// The server to disconnect.
        peer_id: PeerId,
        /// Why.
        reason: PoolDisconnectReason,
    },
}

/// Commands sent to the [`ServerPool`].
#[derive(Debug)]
enum PoolCommand {
    AddServer(NodeRecord),
    DialFailure(PeerId),
    RequestSuccess { peer_id: PeerId, rtt: Duration },
    RequestFailure { peer_id: PeerId, kind: ReputationChangeKind },
    GetServer(PeerId, oneshot::Sender<Option<ServerInfo>>),
    GetServers(oneshot::Sender<Vec<ServerInfo>>),
}

/// A communication channel to the [`ServerPool`] to report outcomes and query its state.
#[derive(Debug, Clone)]
pub struct ServerPoolHandle {
    manager_tx: mpsc::UnboundedSender<PoolCommand>,
}

// === impl ServerPoolHandle ===

impl ServerPoolHandle {
    fn send(&self, cmd: PoolCommand) {
        let _ = self.manager_tx.send(cmd);
    }

    /// Adds a candidate server.
    pub fn add_server(&self, record: NodeRecord) {
        self.send(PoolCommand::AddServer(record));
    }

    /// Reports that dialing the server failed.
    pub fn on_dial_failure(&self, peer_id: PeerId) {
        self.send(PoolCommand::DialFailure(peer_id));
    }

    /// Reports a response of the server that passed verification.
    pub fn on_request_success(&self, peer_id: PeerId, rtt: Duration) {
        self.send(PoolCommand::RequestSuccess { peer_id, rtt });
    }

    /// Reports a request the server failed.
    pub fn on_request_failure(&self, peer_id: PeerId, kind: ReputationChangeKind) {
        self.send(PoolCommand::RequestFailure { peer_id, kind });
    }

    /// Returns the pool's view of the server, or `None` if it is unknown.
    pub async fn record(&self, peer_id: PeerId) -> Option<ServerInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolCommand::GetServer(peer_id, tx));
        rx.await.unwrap_or(None)
    }

    /// Returns all known servers.
    pub async fn servers(&self) -> Vec<ServerInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolCommand::GetServers(tx));
        rx.await.unwrap_or_default()
    }
}

/// Turns discovered servers into a rate limited, prioritized stream of dials.
///
/// The pool learns about established and closed sessions from the [`PeerSet`], and about dial
/// and request outcomes through the [`ServerPoolHandle`]. Every change of a server's track record
/// is written to the [`ReputationStore`].
///
/// The stream ends once the shutdown signal fired.
#[must_use = "Stream does nothing unless polled"]
pub struct ServerPool {
    config: ServerPoolConfig,
    /// All servers known to the pool.
    servers: HashMap<PeerId, ServerInfo>,
    peer_events: UnboundedReceiverStream<PeerSetEvent>,
    /// Copy of the sender half, so new [`ServerPoolHandle`] can be created on demand.
    manager_tx: mpsc::UnboundedSender<PoolCommand>,
    /// Receiver half of the command channel.
    handle_rx: UnboundedReceiverStream<PoolCommand>,
    /// Buffered actions until the pool is polled.
    queued_actions: VecDeque<PoolAction>,
    /// Interval for filling free slots and replacing bad servers.
    refill_interval: Interval,
    /// How many dials were started, drives the exploration rotation.
    dials: u64,
    /// The server that is being disconnected to make room for a better one.
    pending_replacement: Option<PeerId>,
    /// Last time connected servers recovered reputation.
    last_tick: Instant,
    discovery: Box<dyn DiscoverySource>,
    discovery_stream: Option<DiscoveryStream>,
    discovery_retry: Option<Pin<Box<Sleep>>>,
    store: Box<dyn ReputationStore>,
    clock: UnixClock,
    metrics: ServerPoolMetrics,
    shutdown: Shutdown,
}

// === impl ServerPool ===

impl ServerPool {
    /// Creates a new pool for the servers of the given set.
    ///
    /// Stored records are loaded immediately. A store that fails to load is treated as empty.
    pub fn new(
        config: ServerPoolConfig,
        peers: &PeerSet,
        mut store: Box<dyn ReputationStore>,
        mut discovery: Box<dyn DiscoverySource>,
        shutdown: Shutdown,
    ) -> Self {
        let servers = match store.load() {
            Ok(stored) => stored
                .into_iter()
                .map(|server| (server.record.id, ServerInfo::new(server.record, server.reputation)))
                .collect(),
            Err(err) => {
                warn!(target: "net::light::pool", %err, "failed to load server records, starting empty");
                HashMap::new()
            }
        };
        debug!(target: "net::light::pool", servers=servers.len(), "loaded server records");

        let (manager_tx, handle_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let refill_interval =
            tokio::time::interval_at(now + config.refill_interval, config.refill_interval);

        let (discovery_stream, discovery_retry) = match discovery.open() {
            Ok(stream) => (Some(stream), None),
            Err(err) => {
                debug!(target: "net::light::pool", %err, "discovery source unavailable");
                let at = now + config.discovery_retry_interval;
                (None, Some(Box::pin(tokio::time::sleep_until(at))))
            }
        };

        Self {
            config,
            servers,
            peer_events: peers.subscribe(),
            manager_tx,
            handle_rx: UnboundedReceiverStream::new(handle_rx),
            queued_actions: VecDeque::new(),
            refill_interval,
            dials: 0,
            pending_replacement: None,
            last_tick: now,
            discovery,
            discovery_stream,
            discovery_retry,
            store,
            clock: UnixClock::new(),
            metrics: ServerPoolMetrics::default(),
            shutdown,
        }
    }

    /// Returns a new [`ServerPoolHandle`] that can send commands to this type.
    pub fn handle(&self) -> ServerPoolHandle {
        ServerPoolHandle { manager_tx: self.manager_tx.clone() }
    }

    /// Returns the pool's view of the server.
    pub fn server(&self, peer_id: &PeerId) -> Option<&ServerInfo> {
        self.servers.get(peer_id)
    }

    /// Number of known servers.
    pub fn num_known(&self) -> usize {
        self.servers.len()
    }

    /// Number of connected servers.
    pub fn num_connected(&self) -> usize {
        self.servers.values().filter(|server| server.state.is_connected()).count()
    }

    /// Number of dials in progress.
    pub fn num_dialing(&self) -> usize {
        self.servers.values().filter(|server| server.state == ServerState::Dialing).count()
    }

    /// Adds a candidate server, updating the address of a known one.
    pub fn add_server(&mut self, record: NodeRecord) {
        match self.servers.get_mut(&record.id) {
            Some(server) => {
                if server.record != record {
                    trace!(target: "net::light::pool", peer_id=?record.id, addr=%record.tcp_addr(), "updated server address");
                    server.record = record;
                    self.persist(&record.id);
                }
            }
            None => {
                trace!(target: "net::light::pool", peer_id=?record.id, addr=%record.tcp_addr(), "added server");
                let server = ServerInfo::new(record, ReputationRecord::default());
                self.servers.insert(record.id, server);
                self.persist(&record.id);
            }
        }
        self.fill_slots();
    }

    fn jitter(&self) -> f64 {
        if self.config.backoff.jitter > 0.0 {
            rand::thread_rng().gen::<f64>()
        } else {
            0.0
        }
    }

    fn persist(&mut self, peer_id: &PeerId) {
        let Some(server) = self.servers.get(peer_id) else { return };
        if let Err(err) = self.store.save(&server.stored()) {
            warn!(target: "net::light::pool", ?peer_id, %err, "failed to save server record");
        }
    }

    fn on_peer_added(&mut self, peer_id: PeerId, addr: SocketAddr) {
        let now = self.clock.now_millis();
        let server = self.servers.entry(peer_id).or_insert_with(|| {
            ServerInfo::new(NodeRecord::new(addr, peer_id), ReputationRecord::default())
        });
        trace!(target: "net::light::pool", ?peer_id, previous=?server.state, "server connected");
        server.state = ServerState::Connected;
        server.reputation.on_seen(now);
        self.persist(&peer_id);
    }

    fn on_peer_removed(&mut self, peer_id: PeerId) {
        let now = self.clock.now_millis();
        let jitter = self.jitter();
        if self.pending_replacement == Some(peer_id) {
            self.pending_replacement = None;
        }
        let Some(server) = self.servers.get_mut(&peer_id) else { return };
        if !server.state.is_connected() {
            return
        }
        let backoff = server.reputation.on_disconnect(&self.config.backoff, jitter, now);
        trace!(target: "net::light::pool", ?peer_id, ?backoff, "server disconnected");
        server.state = ServerState::Disconnected;
        self.persist(&peer_id);
        self.fill_slots();
    }

    fn on_dial_failure(&mut self, peer_id: PeerId) {
        let now = self.clock.now_millis();
        let jitter = self.jitter();
        let Some(server) = self.servers.get_mut(&peer_id) else { return };
        let backoff = server.reputation.on_failure(
            ReputationChangeKind::FailedToConnect,
            &self.config.reputation_weights,
            &self.config.backoff,
            jitter,
            now,
        );
        debug!(target: "net::light::pool", ?peer_id, ?backoff, "dial failed");
        if server.state == ServerState::Dialing {
            server.state = ServerState::Disconnected;
        }
        self.metrics.failed_dials.increment(1);
        self.persist(&peer_id);
        self.fill_slots();
    }

    fn on_request_success(&mut self, peer_id: PeerId, rtt: Duration) {
        let now = self.clock.now_millis();
        let Some(server) = self.servers.get_mut(&peer_id) else { return };
        server.reputation.on_success(&self.config.reputation_weights, now);
        server.last_rtt = Some(rtt);
        if server.state.is_connected() {
            server.state = ServerState::Useful;
        }
        trace!(target: "net::light::pool", ?peer_id, ?rtt, reputation=server.score(), "useful response");
        self.persist(&peer_id);
    }

    fn on_request_failure(&mut self, peer_id: PeerId, kind: ReputationChangeKind) {
        let now = self.clock.now_millis();
        let jitter = self.jitter();
        let Some(server) = self.servers.get_mut(&peer_id) else { return };
        let backoff = server.reputation.on_failure(
            kind,
            &self.config.reputation_weights,
            &self.config.backoff,
            jitter,
            now,
        );
        debug!(target: "net::light::pool", ?peer_id, ?kind, ?backoff, reputation=server.score(), "request failed");
        if server.state.is_connected() {
            server.state = ServerState::Useless;
            if server.reputation.is_banned() {
                debug!(target: "net::light::pool", ?peer_id, "disconnecting banned server");
                self.queued_actions.push_back(PoolAction::Disconnect {
                    peer_id,
                    reason: PoolDisconnectReason::Banned,
                });
            }
        }
        self.persist(&peer_id);
    }

    fn on_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::AddServer(record) => self.add_server(record),
            PoolCommand::DialFailure(peer_id) => self.on_dial_failure(peer_id),
            PoolCommand::RequestSuccess { peer_id, rtt } => self.on_request_success(peer_id, rtt),
            PoolCommand::RequestFailure { peer_id, kind } => {
                self.on_request_failure(peer_id, kind)
            }
            PoolCommand::GetServer(peer_id, tx) => {
                let _ = tx.send(self.servers.get(&peer_id).cloned());
            }
            PoolCommand::GetServers(tx) => {
                let _ = tx.send(self.servers.values().cloned().collect());
            }
        }
    }

    /// Connected servers regain reputation for every full second they stay connected.
    fn tick(&mut self) {
        let now = Instant::now();
        let secs = now.saturating_duration_since(self.last_tick).as_secs();
        if secs == 0 {
            return
        }
        self.last_tick += Duration::from_secs(secs);
        let amount = self.config.recovery_per_sec.saturating_mul(secs.min(i32::MAX as u64) as i32);
        for server in self.servers.values_mut().filter(|server| server.state.is_connected()) {
            server.reputation.recover(amount);
        }
    }

    /// Returns the best server to dial next.
    ///
    /// Exploitation picks the highest reputation, preferring the server unseen for longest.
    /// Exploration picks a server that was never tried, or the one unseen for longest.
    fn best_candidate(&self, explore: bool) -> Option<PeerId> {
        let now = self.clock.now_millis();
        let candidates = self.servers.values().filter(|server| {
            server.state.is_unconnected() &&
                !server.reputation.is_banned() &&
                !server.reputation.is_backed_off(now)
        });

        let best = if explore {
            candidates.min_by_key(|server| {
                (!server.reputation.is_unexplored(), server.reputation.last_seen())
            })
        } else {
            candidates.max_by_key(|server| (server.score(), Reverse(server.reputation.last_seen())))
        };
        best.map(|server| server.record.id)
    }

    fn next_dial_explores(&self) -> bool {
        let ratio = self.config.explore_ratio as u64;
        ratio > 0 && (self.dials + 1) % ratio == 0
    }

    /// Queues [`PoolAction::Connect`] actions as long as slots and candidates are available.
    fn fill_slots(&mut self) {
        let connected = self.num_connected();
        let mut dialing = self.num_dialing();

        while connected + dialing < self.config.max_connected &&
            dialing < self.config.max_concurrent_dials
        {
            let explore = self.next_dial_explores();
            let Some(peer_id) = self.best_candidate(explore) else { break };
            let Some(server) = self.servers.get_mut(&peer_id) else { break };

            trace!(target: "net::light::pool", ?peer_id, addr=%server.record.tcp_addr(), explore, "schedule dial");
            server.state = ServerState::Dialing;
            self.queued_actions.push_back(PoolAction::Connect {
                peer_id,
                remote_addr: server.record.tcp_addr(),
            });
            self.dials += 1;
            dialing += 1;
        }
    }

    /// Disconnects the worst connected server if a candidate beats it by more than the margin.
    fn replace_worst(&mut self) {
        if self.pending_replacement.is_some() ||
            self.num_connected() + self.num_dialing() < self.config.max_connected
        {
            return
        }

        let Some(worst) = self
            .servers
            .values()
            .filter(|server| server.state.is_connected())
            .min_by_key(|server| server.score())
        else {
            return
        };
        let Some(candidate) =
            self.best_candidate(false).and_then(|peer_id| self.servers.get(&peer_id))
        else {
            return
        };

        if candidate.score() > worst.score().saturating_add(self.config.replacement_margin) {
            let peer_id = worst.record.id;
            debug!(target: "net::light::pool", ?peer_id, worst=worst.score(), candidate=candidate.score(), "replacing server");
            self.pending_replacement = Some(peer_id);
            self.metrics.replaced_servers.increment(1);
            let reason = PoolDisconnectReason::Replaced;
            self.queued_actions.push_back(PoolAction::Disconnect { peer_id, reason });
        }
    }

    fn schedule_discovery_retry(&mut self) {
        let at = Instant::now() + self.config.discovery_retry_interval;
        self.discovery_retry = Some(Box::pin(tokio::time::sleep_until(at)));
    }

    /// Drains the discovery stream, returns `true` if anything happened.
    fn poll_discovery(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        if let Some(retry) = self.discovery_retry.as_mut() {
            if retry.poll_unpin(cx).is_ready() {
                self.discovery_retry = None;
                progress = true;
                match self.discovery.open() {
                    Ok(stream) => self.discovery_stream = Some(stream),
                    Err(err) => {
                        debug!(target: "net::light::pool", %err, "discovery source unavailable");
                        self.schedule_discovery_retry();
                    }
                }
            }
        }

        while let Some(stream) = self.discovery_stream.as_mut() {
            match stream.poll_next_unpin(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(Ok(record))) => {
                    self.add_server(record);
                    progress = true;
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!(target: "net::light::pool", %err, "discovery failed");
                    self.discovery_stream = None;
                    self.schedule_discovery_retry();
                    progress = true;
                }
                Poll::Ready(None) => {
                    trace!(target: "net::light::pool", "discovery stream finished");
                    self.discovery_stream = None;
                    self.schedule_discovery_retry();
                    progress = true;
                }
            }
        }
        progress
    }

    fn update_metrics(&self) {
        self.metrics.known_servers.set(self.servers.len() as f64);
        self.metrics.connected_servers.set(self.num_connected() as f64);
        self.metrics.dialing_servers.set(self.num_dialing() as f64);
    }
}

impl fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPool")
            .field("config", &self.config)
            .field("servers", &self.servers)
            .field("queued_actions", &self.queued_actions)
            .field("pending_replacement", &self.pending_replacement)
            .field("discovery", &self.discovery)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Stream for ServerPool {
    type Item = PoolAction;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.shutdown.poll_unpin(cx).is_ready() {
            return Poll::Ready(None)
        }

        loop {
            // drain buffered actions
            if let Some(action) = this.queued_actions.pop_front() {
                return Poll::Ready(Some(action))
            }

            while let Poll::Ready(Some(cmd)) = this.handle_rx.poll_next_unpin(cx) {
                this.on_command(cmd);
            }

            while let Poll::Ready(Some(event)) = this.peer_events.poll_next_unpin(cx) {
                match event {
                    PeerSetEvent::Added(peer) => this.on_peer_added(peer.id(), peer.addr()),
                    PeerSetEvent::Removed(peer_id) => this.on_peer_removed(peer_id),
                }
            }

            let discovered = this.poll_discovery(cx);

            if this.refill_interval.poll_tick(cx).is_ready() {
                // this ensures the pool will be polled periodically, see [Interval::poll_tick]
                let _ = this.refill_interval.poll_tick(cx);
                this.tick();
                this.replace_worst();
                this.fill_slots();
            }

            if this.queued_actions.is_empty() && !discovered {
                this.update_metrics();
                return Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shutdown::{signal, Signal},
        test_utils::{test_peer, MockConnection},
    };
    use assert_matches::assert_matches;
    use futures::future::poll_fn;
    use reth_light_types::{BackoffConfig, ReputationChangeWeights, BANNED_REPUTATION};
    use std::net::{IpAddr, Ipv4Addr};

    fn node(port: u16) -> NodeRecord {
        NodeRecord::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), PeerId::random())
    }

    fn pool_with(
        config: ServerPoolConfig,
        peers: &PeerSet,
        store: MemoryReputationStore,
        nodes: Vec<NodeRecord>,
    ) -> (ServerPool, Signal) {
        let (signal, shutdown) = signal();
        let pool = ServerPool::new(
            config,
            peers,
            Box::new(store),
            Box::new(StaticDiscovery::new(nodes)),
            shutdown,
        );
        (pool, signal)
    }

    /// Collects all actions that are ready right now.
    async fn ready_actions(pool: &mut ServerPool) -> Vec<PoolAction> {
        poll_fn(|cx| {
            let mut actions = Vec::new();
            while let Poll::Ready(Some(action)) = pool.poll_next_unpin(cx) {
                actions.push(action);
            }
            Poll::Ready(actions)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn dials_discovered_servers() {
        let peers = PeerSet::default();
        let nodes = vec![node(1), node(2)];
        let (mut pool, _signal) =
            pool_with(ServerPoolConfig::test(), &peers, Default::default(), nodes.clone());

        let actions = ready_actions(&mut pool).await;
        assert_eq!(actions.len(), 2);
        for node in nodes {
            assert!(actions.contains(&PoolAction::Connect {
                peer_id: node.id,
                remote_addr: node.tcp_addr()
            }));
        }
        assert_eq!(pool.num_dialing(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn caps_concurrent_dials_and_connections() {
        let peers = PeerSet::default();
        let nodes = (0..10).map(node).collect::<Vec<_>>();
        let config =
            ServerPoolConfig::test().with_max_connected(4).with_max_concurrent_dials(2);
        let (mut pool, _signal) = pool_with(config, &peers, Default::default(), nodes);

        let actions = ready_actions(&mut pool).await;
        assert_eq!(actions.len(), 2);

        // complete both dials, two more slots are left
        let (conn, _rx) = MockConnection::new();
        for action in actions {
            let PoolAction::Connect { peer_id, .. } = action else { unreachable!() };
            peers.register(test_peer(peer_id, conn.clone())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let actions = ready_actions(&mut pool).await;
        assert_eq!(actions.len(), 2);
        assert_eq!(pool.num_connected(), 2);
        assert_eq!(pool.num_dialing(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_failure_backs_off() {
        let peers = PeerSet::default();
        let server = node(1);
        let store = MemoryReputationStore::default();
        let (mut pool, _signal) =
            pool_with(ServerPoolConfig::test(), &peers, store.clone(), vec![server]);

        assert_matches!(&ready_actions(&mut pool).await[..], [PoolAction::Connect { .. }]);
        pool.handle().on_dial_failure(server.id);
        assert!(ready_actions(&mut pool).await.is_empty());

        let info = pool.server(&server.id).unwrap();
        assert_eq!(info.state, ServerState::Disconnected);
        assert_eq!(info.reputation.consecutive_failures(), 1);
        assert!(info.reputation.backoff_until() > 0);
        assert_eq!(store.get(&server.id).unwrap().reputation, info.reputation);

        // test backoff after one failure is 200ms
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_matches!(
            &ready_actions(&mut pool).await[..],
            [PoolAction::Connect { peer_id, .. }] if *peer_id == server.id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_outcomes_update_state() {
        let peers = PeerSet::default();
        let server = node(1);
        let (mut pool, _signal) =
            pool_with(ServerPoolConfig::test(), &peers, Default::default(), vec![server]);
        let handle = pool.handle();
        ready_actions(&mut pool).await;

        let (conn, _rx) = MockConnection::new();
        peers.register(test_peer(server.id, conn)).unwrap();
        ready_actions(&mut pool).await;
        assert_eq!(pool.server(&server.id).unwrap().state, ServerState::Connected);

        handle.on_request_success(server.id, Duration::from_millis(30));
        ready_actions(&mut pool).await;
        let info = pool.server(&server.id).unwrap();
        assert_eq!(info.state, ServerState::Useful);
        assert_eq!(info.reputation.successes(), 1);
        assert_eq!(info.last_rtt, Some(Duration::from_millis(30)));

        handle.on_request_failure(server.id, ReputationChangeKind::Timeout);
        ready_actions(&mut pool).await;
        let info = pool.server(&server.id).unwrap();
        assert_eq!(info.state, ServerState::Useless);
        assert_eq!(info.reputation.failures(), 1);

        peers.unregister(&server.id);
        ready_actions(&mut pool).await;
        assert_eq!(pool.server(&server.id).unwrap().state, ServerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn bans_misbehaving_server() {
        let peers = PeerSet::default();
        let server = node(1);
        let (mut pool, _signal) =
            pool_with(ServerPoolConfig::test(), &peers, Default::default(), vec![server]);
        let handle = pool.handle();
        ready_actions(&mut pool).await;

        let (conn, _rx) = MockConnection::new();
        peers.register(test_peer(server.id, conn)).unwrap();
        ready_actions(&mut pool).await;
        handle.on_request_failure(server.id, ReputationChangeKind::Other(2 * BANNED_REPUTATION));
        assert_eq!(
            ready_actions(&mut pool).await,
            vec![PoolAction::Disconnect {
                peer_id: server.id,
                reason: PoolDisconnectReason::Banned
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_worst_server_with_margin() {
        let peers = PeerSet::default();
        let good = node(1);
        let bad = node(2);
        let weights = ReputationChangeWeights::default();
        let no_backoff = BackoffConfig { min: Duration::ZERO, max: Duration::ZERO, jitter: 0.0 };
        let mut bad_record = ReputationRecord::default();
        for _ in 0..2 {
            bad_record.on_failure(ReputationChangeKind::BadResponse, &weights, &no_backoff, 0.0, 0);
        }
        let store = MemoryReputationStore::with_servers([
            StoredServer { record: bad, reputation: bad_record },
            StoredServer { record: good, reputation: ReputationRecord::default() },
        ]);
        let config = ServerPoolConfig::test().with_max_connected(1);
        let (mut pool, _signal) = pool_with(config, &peers, store, vec![]);

        // the only slot goes to the better server first
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_matches!(
            &ready_actions(&mut pool).await[..],
            [PoolAction::Connect { peer_id, .. }] if *peer_id == good.id
        );

        // it is unreachable for now, the worse one takes the slot
        pool.handle().on_dial_failure(good.id);
        assert_matches!(
            &ready_actions(&mut pool).await[..],
            [PoolAction::Connect { peer_id, .. }] if *peer_id == bad.id
        );
        let (conn, _rx) = MockConnection::new();
        peers.register(test_peer(bad.id, conn)).unwrap();
        assert!(ready_actions(&mut pool).await.is_empty());
        assert!(pool.server(&bad.id).unwrap().state.is_connected());

        // once the better server's backoff passed it replaces the worse one
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            ready_actions(&mut pool).await,
            vec![PoolAction::Disconnect { peer_id: bad.id, reason: PoolDisconnectReason::Replaced }]
        );

        peers.unregister(&bad.id);
        assert_matches!(
            &ready_actions(&mut pool).await[..],
            [PoolAction::Connect { peer_id, .. }] if *peer_id == good.id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_store_starts_empty() {
        #[derive(Debug)]
        struct Corrupt;
        impl ReputationStore for Corrupt {
            fn load(&mut self) -> Result<Vec<StoredServer>, StoreError> {
                Err(StoreError::Json(serde_json::from_str::<u8>("x").unwrap_err()))
            }
            fn save(&mut self, _: &StoredServer) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let pool = ServerPool::new(
            ServerPoolConfig::test(),
            &peers,
            Box::new(Corrupt),
            Box::new(StaticDiscovery::default()),
            shutdown,
        );
        assert_eq!(pool.num_known(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reopens_failed_discovery() {
        #[derive(Debug, Default)]
        struct Flaky {
            opened: usize,
        }
        impl DiscoverySource for Flaky {
            fn open(&mut self) -> Result<DiscoveryStream, DiscoveryError> {
                self.opened += 1;
                if self.opened == 1 {
                    return Err(DiscoveryError::Unavailable("offline".to_string()))
                }
                let node = NodeRecord::new(
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30303),
                    PeerId::random(),
                );
                Ok(futures::stream::iter([Ok(node)]).boxed())
            }
        }

        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let mut pool = ServerPool::new(
            ServerPoolConfig::test(),
            &peers,
            Box::new(MemoryReputationStore::default()),
            Box::new(Flaky::default()),
            shutdown,
        );
        assert!(ready_actions(&mut pool).await.is_empty());
        assert_eq!(pool.num_known(), 0);

        tokio::time::sleep(ServerPoolConfig::test().discovery_retry_interval).await;
        assert_matches!(&ready_actions(&mut pool).await[..], [PoolAction::Connect { .. }]);
        assert_eq!(pool.num_known(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explores_unexplored_servers() {
        let peers = PeerSet::default();
        let known = node(1);
        let mut record = ReputationRecord::default();
        record.on_success(&ReputationChangeWeights::default(), 1);
        let fresh = node(2);
        let store = MemoryReputationStore::with_servers([
            StoredServer { record: known, reputation: record },
            StoredServer { record: fresh, reputation: ReputationRecord::default() },
        ]);
        let config = ServerPoolConfig::test().with_max_connected(1);
        let (mut pool, _signal) = pool_with(config, &peers, store, vec![]);
        pool.config.explore_ratio = 1;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_matches!(
            &ready_actions(&mut pool).await[..],
            [PoolAction::Connect { peer_id, .. }] if *peer_id == fresh.id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ends_on_shutdown() {
        let peers = PeerSet::default();
        let (mut pool, signal) =
            pool_with(ServerPoolConfig::test(), &peers, Default::default(), vec![]);
        signal.fire();
        assert!(pool.next().await.is_none());
    }
}

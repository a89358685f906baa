//! Broadcast of local transactions to light servers until they are mined.

use crate::{
    metrics::TxRelayMetrics,
    peer::LightPeer,
    peer_set::{PeerSet, PeerSetEvent},
    shutdown::Shutdown,
};
use alloy_primitives::Bytes;
use futures::{FutureExt, StreamExt};
use reth_light_types::{PeerId, RequestKind, TxHash, TxRelayConfig};
use std::{
    collections::{hash_map::Entry, HashMap, HashSet, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// Commands sent to the [`TxRelay`].
#[derive(Debug)]
enum RelayCommand {
    Submit(Vec<(TxHash, Bytes)>),
    Discard(Vec<TxHash>),
    Mined(Vec<TxHash>),
    Pending(oneshot::Sender<Vec<TxHash>>),
}

/// Api to interact with the [`TxRelay`] task.
#[derive(Debug, Clone)]
pub struct TxRelayHandle {
    /// Command channel to the [`TxRelay`]
    manager_tx: mpsc::UnboundedSender<RelayCommand>,
}

// === impl TxRelayHandle ===

impl TxRelayHandle {
    fn send(&self, cmd: RelayCommand) {
        let _ = self.manager_tx.send(cmd);
    }

    /// Adds the encoded transactions to the pending set and sends them to all connected servers.
    pub fn submit(&self, txs: Vec<(TxHash, Bytes)>) {
        self.send(RelayCommand::Submit(txs));
    }

    /// Stops relaying the transaction.
    pub fn discard(&self, hash: TxHash) {
        self.send(RelayCommand::Discard(vec![hash]));
    }

    /// Signals that the transactions were included in the canonical chain.
    pub fn notify_mined(&self, hashes: Vec<TxHash>) {
        self.send(RelayCommand::Mined(hashes));
    }

    /// Returns the hashes of all pending transactions, oldest first.
    pub async fn pending(&self) -> Vec<TxHash> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Pending(tx));
        rx.await.unwrap_or_default()
    }
}

/// A transaction that was not mined yet.
#[derive(Debug)]
struct PendingTx {
    raw: Bytes,
    /// When the transaction was submitted.
    added: Instant,
    /// Servers that received this transaction.
    sent_to: HashSet<PeerId>,
}

/// Relays local transactions to every capable server.
///
/// New transactions go to all connected servers, a newly joined server receives the whole
/// pending set. Nothing is verified here, servers accept or reject on their own.
///
/// This is an endless future that should be spawned, it resolves once the shutdown signal fired.
#[must_use = "Manager does nothing unless polled."]
pub struct TxRelay {
    config: TxRelayConfig,
    peers: PeerSet,
    /// Membership changes of the peer set.
    peer_events: UnboundedReceiverStream<PeerSetEvent>,
    /// All transactions not known to be mined.
    pending: HashMap<TxHash, PendingTx>,
    /// Pending transactions in submission order.
    order: VecDeque<TxHash>,
    /// Send half for the command channel.
    command_tx: mpsc::UnboundedSender<RelayCommand>,
    /// Incoming commands from [`TxRelayHandle`].
    command_rx: UnboundedReceiverStream<RelayCommand>,
    metrics: TxRelayMetrics,
    shutdown: Shutdown,
}

// === impl TxRelay ===

impl TxRelay {
    /// Sets up a new instance relaying to the servers of the given set.
    pub fn new(config: TxRelayConfig, peers: PeerSet, shutdown: Shutdown) -> Self {
        let peer_events = peers.subscribe();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            config,
            peers,
            peer_events,
            pending: HashMap::new(),
            order: VecDeque::new(),
            command_tx,
            command_rx: UnboundedReceiverStream::new(command_rx),
            metrics: TxRelayMetrics::default(),
            shutdown,
        }
    }

    /// Returns a new handle that can send commands to this type.
    pub fn handle(&self) -> TxRelayHandle {
        TxRelayHandle { manager_tx: self.command_tx.clone() }
    }

    /// Number of pending transactions.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    fn on_submit(&mut self, txs: Vec<(TxHash, Bytes)>) {
        let now = Instant::now();
        let mut added = 0;
        for (hash, raw) in txs {
            match self.pending.entry(hash) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(PendingTx { raw, added: now, sent_to: HashSet::new() });
                    self.order.push_back(hash);
                    added += 1;
                }
            }
        }

        while self.order.len() > self.config.max_pending {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(tx) = self.pending.remove(&evicted) {
                    let age = tx.added.elapsed();
                    debug!(target: "net::light::relay", ?evicted, ?age, "pending set full, dropping oldest transaction");
                    self.metrics.pending_duration.record(age.as_secs_f64());
                }
            }
        }

        if added > 0 {
            trace!(target: "net::light::relay", added, pending=self.pending.len(), "submitted transactions");
            for peer in self.peers.peers() {
                self.send_pending_to(&peer);
            }
        }
    }

    fn remove(&mut self, hashes: Vec<TxHash>) {
        let mut removed = false;
        for hash in hashes {
            if let Some(tx) = self.pending.remove(&hash) {
                let age = tx.added.elapsed();
                trace!(target: "net::light::relay", ?hash, ?age, "transaction no longer pending");
                self.metrics.pending_duration.record(age.as_secs_f64());
                removed = true;
            }
        }
        if removed {
            let pending = &self.pending;
            self.order.retain(|hash| pending.contains_key(hash));
        }
    }

    /// Sends every pending transaction the server did not receive yet, in batches.
    ///
    /// Transactions of a batch that failed to send stay unsent for this server.
    fn send_pending_to(&mut self, peer: &LightPeer) {
        if !peer.serves(RequestKind::SendTransactions) {
            return
        }
        let peer_id = peer.id();
        let unsent = self
            .order
            .iter()
            .filter(|hash| self.pending.get(*hash).is_some_and(|tx| !tx.sent_to.contains(&peer_id)))
            .copied()
            .collect::<Vec<_>>();

        for batch in unsent.chunks(self.config.max_batch.max(1)) {
            let raw = batch
                .iter()
                .filter_map(|hash| self.pending.get(hash).map(|tx| tx.raw.clone()))
                .collect::<Vec<_>>();
            match peer.send_transactions(&raw) {
                Ok(()) => {
                    self.metrics.sent_messages.increment(1);
                    for hash in batch {
                        if let Some(tx) = self.pending.get_mut(hash) {
                            tx.sent_to.insert(peer_id);
                        }
                    }
                }
                Err(err) => {
                    debug!(target: "net::light::relay", ?peer_id, %err, "failed to send transactions");
                    break
                }
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerSetEvent) {
        match event {
            PeerSetEvent::Added(peer) => {
                trace!(target: "net::light::relay", peer_id=?peer.id(), "sending pending transactions to new peer");
                self.send_pending_to(&peer);
            }
            PeerSetEvent::Removed(peer_id) => {
                for tx in self.pending.values_mut() {
                    tx.sent_to.remove(&peer_id);
                }
            }
        }
    }

    fn on_command(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Submit(txs) => self.on_submit(txs),
            RelayCommand::Discard(hashes) | RelayCommand::Mined(hashes) => self.remove(hashes),
            RelayCommand::Pending(tx) => {
                let _ = tx.send(self.order.iter().copied().collect());
            }
        }
    }
}

impl Future for TxRelay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.shutdown.poll_unpin(cx).is_ready() {
            debug!(target: "net::light::relay", pending=this.pending.len(), "relay shutting down");
            return Poll::Ready(())
        }

        while let Poll::Ready(Some(event)) = this.peer_events.poll_next_unpin(cx) {
            this.on_peer_event(event);
        }

        while let Poll::Ready(Some(cmd)) = this.command_rx.poll_next_unpin(cx) {
            this.on_command(cmd);
        }

        this.metrics.pending_transactions.set(this.pending.len() as f64);
        Poll::Pending
    }
}

impl fmt::Debug for TxRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRelay")
            .field("config", &self.config)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shutdown::signal,
        test_utils::{test_peer, MockConnection, SentMessage},
    };
    use assert_matches::assert_matches;
    use futures::future::poll_fn;
    use std::time::Duration;

    async fn drive(relay: &mut TxRelay) {
        poll_fn(|cx| {
            let _ = Pin::new(&mut *relay).poll(cx);
            Poll::Ready(())
        })
        .await
    }

    fn tx(n: u8) -> (TxHash, Bytes) {
        (TxHash::with_last_byte(n), Bytes::from(vec![n]))
    }

    #[tokio::test]
    async fn batches_and_tracks_per_peer() {
        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let config = TxRelayConfig { max_batch: 2, ..Default::default() };
        let mut relay = TxRelay::new(config, peers.clone(), shutdown);
        let handle = relay.handle();

        let (conn, mut sent) = MockConnection::new();
        peers.register(test_peer(PeerId::random(), conn)).unwrap();
        handle.submit(vec![tx(1), tx(2), tx(3)]);
        drive(&mut relay).await;

        assert_matches!(sent.try_recv(), Ok(SentMessage::Transactions(txs)) if txs.len() == 2);
        assert_matches!(sent.try_recv(), Ok(SentMessage::Transactions(txs)) if txs.len() == 1);

        // already known transactions are not sent again
        handle.submit(vec![tx(3), tx(4)]);
        drive(&mut relay).await;
        assert_eq!(sent.try_recv(), Ok(SentMessage::Transactions(vec![tx(4).1])));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_send_is_retried_on_rejoin() {
        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let mut relay = TxRelay::new(TxRelayConfig::default(), peers.clone(), shutdown);
        let handle = relay.handle();

        let id = PeerId::random();
        let (conn, mut sent) = MockConnection::new();
        conn.set_failing(true);
        peers.register(test_peer(id, conn.clone())).unwrap();
        handle.submit(vec![tx(1)]);
        drive(&mut relay).await;
        assert!(sent.try_recv().is_err());

        conn.set_failing(false);
        peers.unregister(&id);
        peers.register(test_peer(id, conn)).unwrap();
        drive(&mut relay).await;
        assert_eq!(sent.try_recv(), Ok(SentMessage::Transactions(vec![tx(1).1])));
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let config = TxRelayConfig { max_pending: 2, ..Default::default() };
        let mut relay = TxRelay::new(config, peers, shutdown);
        let handle = relay.handle();

        handle.submit(vec![tx(1), tx(2), tx(3)]);
        drive(&mut relay).await;
        assert_eq!(relay.num_pending(), 2);

        let pending = handle.pending();
        drive(&mut relay).await;
        assert_eq!(pending.await, vec![tx(2).0, tx(3).0]);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_submission_time() {
        let peers = PeerSet::default();
        let (_signal, shutdown) = signal();
        let mut relay = TxRelay::new(TxRelayConfig::default(), peers, shutdown);
        let handle = relay.handle();

        handle.submit(vec![tx(1)]);
        drive(&mut relay).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        // resubmitting keeps the original submission time
        handle.submit(vec![tx(1), tx(2)]);
        drive(&mut relay).await;
        assert_eq!(relay.pending[&tx(1).0].added.elapsed(), Duration::from_secs(5));
        assert_eq!(relay.pending[&tx(2).0].added.elapsed(), Duration::ZERO);

        handle.notify_mined(vec![tx(1).0]);
        drive(&mut relay).await;
        assert_eq!(relay.num_pending(), 1);
    }
}

//! Assigns queued requests to the least loaded eligible servers.

use crate::{
    error::PeerSendError,
    metrics::DistributorMetrics,
    peer::{LightPeer, RequestId},
    peer_set::{PeerSet, PeerSetEvent},
    shutdown::Shutdown,
};
use futures::{FutureExt, StreamExt};
use reth_light_types::PeerId;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::{
    sync::mpsc,
    time::{Instant, Sleep},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// Decides whether a request may be sent to the given server.
pub type CanSendFn = Box<dyn Fn(&LightPeer) -> bool + Send>;

/// Hands a request to the given server.
pub type SendFn = Box<dyn FnMut(&LightPeer) -> Result<(), PeerSendError> + Send>;

/// Notifications to the owner of a [`DistRequest`].
#[derive(Debug, Clone)]
pub enum DistEvent {
    /// The request was handed to this server.
    Dispatched {
        /// The server that is now serving the request.
        peer: Arc<LightPeer>,
    },
    /// The server serving the request disconnected, the request is queued again.
    Requeued {
        /// The server that disconnected.
        peer_id: PeerId,
    },
    /// No server is able to serve the request, it was removed from the queue.
    Dropped,
}

/// A request waiting to be assigned to a server.
pub struct DistRequest {
    id: RequestId,
    priority: u32,
    can_send: CanSendFn,
    send: SendFn,
    wait_for_peers: Instant,
    excluded: HashSet<PeerId>,
    events: mpsc::UnboundedSender<(RequestId, DistEvent)>,
}

// === impl DistRequest ===

impl DistRequest {
    /// Creates a new request.
    ///
    /// While no registered server could ever serve the request it is kept in the queue until
    /// `wait_for_peers`, then it is dropped.
    pub fn new(
        id: RequestId,
        can_send: CanSendFn,
        send: SendFn,
        wait_for_peers: Instant,
        events: mpsc::UnboundedSender<(RequestId, DistEvent)>,
    ) -> Self {
        Self {
            id,
            priority: 0,
            can_send,
            send,
            wait_for_peers,
            excluded: HashSet::new(),
            events,
        }
    }

    /// Sets the priority. Higher priorities are dispatched first.
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The identifier of the request.
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Returns `true` if the request may be sent to the given server.
    fn is_eligible(&self, peer: &LightPeer) -> bool {
        !self.excluded.contains(&peer.id()) && (self.can_send)(peer)
    }

    fn notify(&self, event: DistEvent) {
        let _ = self.events.send((self.id, event));
    }

    /// Position in the queue: by priority, then by submission order.
    const fn queue_key(&self) -> QueueKey {
        (Reverse(self.priority), self.id)
    }
}

impl fmt::Debug for DistRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("wait_for_peers", &self.wait_for_peers)
            .field("excluded", &self.excluded)
            .finish_non_exhaustive()
    }
}

type QueueKey = (Reverse<u32>, RequestId);

/// Commands sent to the [`RequestDistributor`].
#[derive(Debug)]
enum DistCommand {
    Queue(DistRequest),
    Cancel(RequestId),
    Complete(RequestId),
    Retry { id: RequestId, failed_peer: PeerId },
}

/// A cloneable handle to the [`RequestDistributor`].
#[derive(Debug, Clone)]
pub struct DistributorHandle {
    next_id: Arc<AtomicU64>,
    manager_tx: mpsc::UnboundedSender<DistCommand>,
}

// === impl DistributorHandle ===

impl DistributorHandle {
    /// Returns a new, process wide unique request id.
    pub fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, cmd: DistCommand) {
        let _ = self.manager_tx.send(cmd);
    }

    /// Queues the request for dispatch.
    pub fn queue(&self, request: DistRequest) -> RequestId {
        let id = request.id;
        self.send(DistCommand::Queue(request));
        id
    }

    /// Removes the request from the queue, or forgets it if it is in flight.
    ///
    /// A canceled request is never dispatched again.
    pub fn cancel(&self, id: RequestId) {
        self.send(DistCommand::Cancel(id));
    }

    /// Marks an in-flight request as answered, freeing the slot at its server.
    pub fn complete(&self, id: RequestId) {
        self.send(DistCommand::Complete(id));
    }

    /// Queues an in-flight request again, excluding the server that failed it.
    pub fn retry(&self, id: RequestId, failed_peer: PeerId) {
        self.send(DistCommand::Retry { id, failed_peer });
    }
}

/// A request handed to a server.
#[derive(Debug)]
struct InFlight {
    request: DistRequest,
    peer: Arc<LightPeer>,
}

/// Outcome of trying to dispatch a single request.
enum Dispatch {
    Sent(Arc<LightPeer>),
    Waiting,
    Dropped,
}

/// Maps queued requests to servers.
///
/// The queue and all load accounting are owned by this type and only changed while it is polled.
/// The queue is evaluated again after every command and every change of the [`PeerSet`].
///
/// This is an endless future that should be spawned, it resolves once the shutdown signal fired.
#[must_use = "The distributor does nothing unless polled"]
pub struct RequestDistributor {
    peers: PeerSet,
    peer_events: UnboundedReceiverStream<PeerSetEvent>,
    /// Requests waiting for a server, in dispatch order.
    queue: BTreeMap<QueueKey, DistRequest>,
    in_flight: HashMap<RequestId, InFlight>,
    /// Fires when the earliest `wait_for_peers` of a waiting request passed.
    wait_timer: Option<Pin<Box<Sleep>>>,
    handle: DistributorHandle,
    command_rx: UnboundedReceiverStream<DistCommand>,
    metrics: DistributorMetrics,
    shutdown: Shutdown,
}

// === impl RequestDistributor ===

impl RequestDistributor {
    /// Creates a new distributor for the servers of the given set.
    pub fn new(peers: PeerSet, shutdown: Shutdown) -> Self {
        let (manager_tx, command_rx) = mpsc::unbounded_channel();
        let peer_events = peers.subscribe();
        Self {
            peers,
            peer_events,
            queue: BTreeMap::new(),
            in_flight: HashMap::new(),
            wait_timer: None,
            handle: DistributorHandle { next_id: Arc::new(AtomicU64::new(1)), manager_tx },
            command_rx: UnboundedReceiverStream::new(command_rx),
            metrics: DistributorMetrics::default(),
            shutdown,
        }
    }

    /// Returns a new [`DistributorHandle`] that can send commands to this type.
    pub fn handle(&self) -> DistributorHandle {
        self.handle.clone()
    }

    /// Number of requests waiting for a server.
    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of requests served right now.
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn on_command(&mut self, cmd: DistCommand) {
        match cmd {
            DistCommand::Queue(request) => {
                trace!(target: "net::light::distributor", id=request.id, "queued request");
                self.queue.insert(request.queue_key(), request);
            }
            DistCommand::Cancel(id) => {
                if let Some(in_flight) = self.in_flight.remove(&id) {
                    in_flight.peer.dec_outstanding();
                } else {
                    self.queue.retain(|_, request| request.id != id);
                }
                trace!(target: "net::light::distributor", id, "canceled request");
            }
            DistCommand::Complete(id) => {
                if let Some(in_flight) = self.in_flight.remove(&id) {
                    in_flight.peer.dec_outstanding();
                }
            }
            DistCommand::Retry { id, failed_peer } => {
                let now = Instant::now();
                if let Some(InFlight { mut request, peer }) = self.in_flight.remove(&id) {
                    peer.dec_outstanding();
                    request.excluded.insert(failed_peer);
                    request.wait_for_peers = now;
                    trace!(target: "net::light::distributor", id, ?failed_peer, "retrying request");
                    self.queue.insert(request.queue_key(), request);
                } else if let Some(request) =
                    self.queue.values_mut().find(|request| request.id == id)
                {
                    // already requeued after a disconnect
                    request.excluded.insert(failed_peer);
                    request.wait_for_peers = now;
                }
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerSetEvent) {
        match event {
            PeerSetEvent::Added(peer) => {
                trace!(target: "net::light::distributor", id=?peer.id(), "peer added");
            }
            PeerSetEvent::Removed(peer_id) => {
                let ids = self
                    .in_flight
                    .iter()
                    // a reconnected peer with the same id keeps its requests
                    .filter(|(_, in_flight)| {
                        in_flight.peer.id() == peer_id && !in_flight.peer.is_alive()
                    })
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();
                for id in ids {
                    if let Some(InFlight { request, peer }) = self.in_flight.remove(&id) {
                        peer.dec_outstanding();
                        debug!(target: "net::light::distributor", id, ?peer_id, "requeueing request of dropped peer");
                        request.notify(DistEvent::Requeued { peer_id });
                        self.metrics.requeued_requests.increment(1);
                        self.queue.insert(request.queue_key(), request);
                    }
                }
            }
        }
    }

    /// Tries to hand the request to the least loaded eligible server.
    ///
    /// A server whose connection rejects the request is excluded for the rest of the request's
    /// lifetime and the next best server is tried.
    fn try_dispatch(&self, request: &mut DistRequest, now: Instant) -> Dispatch {
        loop {
            let best = self.peers.best(|peer| peer.has_capacity() && request.is_eligible(peer));
            let Some(peer) = best else { break };
            match (request.send)(&peer) {
                Ok(()) => return Dispatch::Sent(peer),
                Err(err) => {
                    debug!(target: "net::light::distributor", id=request.id, peer=?peer.id(), %err, "failed to send request");
                    request.excluded.insert(peer.id());
                }
            }
        }

        // busy servers that could serve the request keep it alive
        let servable = self.peers.peers().iter().any(|peer| request.is_eligible(peer));
        if !servable && now >= request.wait_for_peers {
            return Dispatch::Dropped
        }
        Dispatch::Waiting
    }

    /// Walks the queue in order and dispatches everything that can be dispatched.
    fn dispatch(&mut self) {
        if self.queue.is_empty() {
            self.wait_timer = None;
            return
        }

        let now = Instant::now();
        let mut next_wakeup: Option<Instant> = None;
        for (key, mut request) in std::mem::take(&mut self.queue) {
            match self.try_dispatch(&mut request, now) {
                Dispatch::Sent(peer) => {
                    peer.inc_outstanding();
                    trace!(target: "net::light::distributor", id=request.id, peer=?peer.id(), "dispatched request");
                    request.notify(DistEvent::Dispatched { peer: Arc::clone(&peer) });
                    self.metrics.dispatched_requests.increment(1);
                    self.in_flight.insert(request.id, InFlight { request, peer });
                }
                Dispatch::Waiting => {
                    if request.wait_for_peers > now {
                        next_wakeup = Some(
                            next_wakeup.map_or(request.wait_for_peers, |at| {
                                at.min(request.wait_for_peers)
                            }),
                        );
                    }
                    self.queue.insert(key, request);
                }
                Dispatch::Dropped => {
                    debug!(target: "net::light::distributor", id=request.id, "no peer can serve request");
                    request.notify(DistEvent::Dropped);
                    self.metrics.dropped_requests.increment(1);
                }
            }
        }

        self.wait_timer = next_wakeup.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    fn update_metrics(&self) {
        self.metrics.queued_requests.set(self.queue.len() as f64);
        self.metrics.in_flight_requests.set(self.in_flight.len() as f64);
    }

    fn on_shutdown(&mut self) {
        debug!(target: "net::light::distributor", queued=self.queue.len(), in_flight=self.in_flight.len(), "distributor shutting down");
        for (_, in_flight) in self.in_flight.drain() {
            in_flight.peer.dec_outstanding();
        }
        self.queue.clear();
        self.update_metrics();
    }
}

impl Future for RequestDistributor {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.shutdown.poll_unpin(cx).is_ready() {
            this.on_shutdown();
            return Poll::Ready(())
        }

        loop {
            let mut changed = false;

            // the handle held by this type keeps the channel open
            while let Poll::Ready(Some(cmd)) = this.command_rx.poll_next_unpin(cx) {
                this.on_command(cmd);
                changed = true;
            }

            while let Poll::Ready(Some(event)) = this.peer_events.poll_next_unpin(cx) {
                this.on_peer_event(event);
                changed = true;
            }

            if let Some(timer) = this.wait_timer.as_mut() {
                if timer.poll_unpin(cx).is_ready() {
                    this.wait_timer = None;
                    changed = true;
                }
            }

            if !changed {
                break
            }
            this.dispatch();
        }

        this.update_metrics();
        Poll::Pending
    }
}

impl fmt::Debug for RequestDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDistributor")
            .field("queue", &self.queue)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

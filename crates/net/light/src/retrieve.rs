//! Turns requests into verified values, retrying with other servers on failure.

use crate::{
    distributor::{CanSendFn, DistEvent, DistRequest, DistributorHandle, SendFn},
    error::{AttemptError, RetrieveError, RetrieveResult, VerifyError},
    metrics::RetrieveMetrics,
    peer::{LightPeer, LightRequest, RequestId},
    requests::OdrRequest,
    server_pool::ServerPoolHandle,
    shutdown::Shutdown,
};
use alloy_primitives::Bytes;
use futures::{FutureExt, StreamExt};
use pin_project::pin_project;
use reth_light_types::{Capability, PeerId, ReputationChangeKind, RetrieveConfig};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace};

/// Longest deadline a retrieval may have, longer deadlines are capped.
///
/// The timer wheel rejects instants more than about two years ahead.
pub const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A retrieval in progress, resolves to the verified value.
///
/// Dropping it cancels the retrieval.
#[derive(Debug)]
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct PendingRetrieval<T> {
    id: RequestId,
    #[pin]
    receiver: oneshot::Receiver<RetrieveResult<T>>,
}

impl<T> PendingRetrieval<T> {
    /// The id of the retrieval, see [`RetrieveHandle::cancel`].
    pub const fn id(&self) -> RequestId {
        self.id
    }
}

impl<T> Future for PendingRetrieval<T> {
    type Output = RetrieveResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        this.receiver.poll(cx).map(|r| match r {
            Ok(r) => r,
            Err(err) => Err(err.into()),
        })
    }
}

/// A request with its caller, independent of the request type.
trait ErasedRetrieval: fmt::Debug + Send {
    /// Verifies the response and hands the value to the caller.
    fn verify(&mut self, response: &Bytes) -> Result<(), VerifyError>;

    /// Hands the error to the caller.
    fn fail(&mut self, err: RetrieveError);

    /// Returns `true` if nobody waits for the result anymore.
    fn is_canceled(&self) -> bool;
}

struct TypedRetrieval<R: OdrRequest> {
    request: R,
    tx: Option<oneshot::Sender<RetrieveResult<R::Output>>>,
}

impl<R: OdrRequest> ErasedRetrieval for TypedRetrieval<R> {
    fn verify(&mut self, response: &Bytes) -> Result<(), VerifyError> {
        let value = self.request.verify(response)?;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
        Ok(())
    }

    fn fail(&mut self, err: RetrieveError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    fn is_canceled(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl<R: OdrRequest> fmt::Debug for TypedRetrieval<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedRetrieval")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// A new retrieval handed to the [`RetrieveManager`].
#[derive(Debug)]
struct Submission {
    id: RequestId,
    capability: Capability,
    encoded: LightRequest,
    deadline: Instant,
    request: Box<dyn ErasedRetrieval>,
}

/// Commands sent to the [`RetrieveManager`].
#[derive(Debug)]
enum RetrieveCommand {
    Submit(Submission),
    Cancel(RequestId),
    Deliver { peer_id: PeerId, id: RequestId, payload: Bytes },
}

/// The entry point for retrievals.
#[derive(Debug, Clone)]
pub struct RetrieveHandle {
    distributor: DistributorHandle,
    default_deadline: Duration,
    manager_tx: mpsc::UnboundedSender<RetrieveCommand>,
}

// === impl RetrieveHandle ===

impl RetrieveHandle {
    fn send(&self, cmd: RetrieveCommand) {
        let _ = self.manager_tx.send(cmd);
    }

    /// Starts a retrieval with the configured default deadline.
    pub fn submit<R: OdrRequest>(&self, request: R) -> PendingRetrieval<R::Output> {
        self.submit_with_deadline(request, self.default_deadline)
    }

    /// Starts a retrieval that gives up after `deadline`, at most [`MAX_DEADLINE`].
    pub fn submit_with_deadline<R: OdrRequest>(
        &self,
        request: R,
        deadline: Duration,
    ) -> PendingRetrieval<R::Output> {
        let id = self.distributor.next_request_id();
        let (tx, receiver) = oneshot::channel();
        let submission = Submission {
            id,
            capability: request.capability(),
            encoded: request.encode(),
            deadline: Instant::now() + deadline.min(MAX_DEADLINE),
            request: Box::new(TypedRetrieval { request, tx: Some(tx) }),
        };
        // if the manager is gone the sender is dropped and the caller sees a shutdown
        self.send(RetrieveCommand::Submit(submission));
        PendingRetrieval { id, receiver }
    }

    /// Retrieves the verified value with the configured default deadline.
    pub async fn retrieve<R: OdrRequest>(&self, request: R) -> RetrieveResult<R::Output> {
        self.submit(request).await
    }

    /// Cancels the retrieval, the caller observes [`RetrieveError::Canceled`].
    pub fn cancel(&self, id: RequestId) {
        self.send(RetrieveCommand::Cancel(id));
    }

    /// Hands a response read from a server's connection to the manager.
    pub fn deliver(&self, peer_id: PeerId, id: RequestId, payload: Bytes) {
        self.send(RetrieveCommand::Deliver { peer_id, id, payload });
    }
}

/// A request sent to a single server.
#[derive(Debug)]
struct Attempt {
    peer: Arc<LightPeer>,
    sent_at: Instant,
    timeout: delay_queue::Key,
}

#[derive(Debug)]
struct ActiveRetrieval {
    request: Box<dyn ErasedRetrieval>,
    deadline: delay_queue::Key,
    attempt: Option<Attempt>,
    /// All servers this retrieval was sent to.
    tried: HashSet<PeerId>,
    /// A response that arrived before the dispatch was observed.
    early_response: Option<(PeerId, Bytes)>,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Deadline(RequestId),
    Attempt(RequestId),
}

/// Drives all retrievals.
///
/// A retrieval is handed to the distributor, which picks a server. A response is verified here;
/// a verification failure, a timeout or a disconnect of the server penalizes the server and sends
/// the request to another one, until the attempt ceiling or the deadline is reached. All deadlines
/// share a single timer queue.
///
/// This is an endless future that should be spawned. Once the shutdown signal fired every
/// outstanding retrieval fails with [`RetrieveError::Shutdown`].
#[must_use = "The retrieve manager does nothing unless polled"]
pub struct RetrieveManager {
    config: RetrieveConfig,
    distributor: DistributorHandle,
    pool: ServerPoolHandle,
    retrievals: HashMap<RequestId, ActiveRetrieval>,
    timers: DelayQueue<Timer>,
    dist_events_tx: mpsc::UnboundedSender<(RequestId, DistEvent)>,
    dist_events: UnboundedReceiverStream<(RequestId, DistEvent)>,
    handle: RetrieveHandle,
    command_rx: UnboundedReceiverStream<RetrieveCommand>,
    metrics: RetrieveMetrics,
    shutdown: Shutdown,
}

// === impl RetrieveManager ===

impl RetrieveManager {
    /// Creates a new manager that dispatches through the given distributor and reports server
    /// outcomes to the given pool.
    pub fn new(
        config: RetrieveConfig,
        distributor: DistributorHandle,
        pool: ServerPoolHandle,
        shutdown: Shutdown,
    ) -> Self {
        let (manager_tx, command_rx) = mpsc::unbounded_channel();
        let (dist_events_tx, dist_events) = mpsc::unbounded_channel();
        let handle = RetrieveHandle {
            distributor: distributor.clone(),
            default_deadline: config.default_deadline,
            manager_tx,
        };
        Self {
            config,
            distributor,
            pool,
            retrievals: HashMap::new(),
            timers: DelayQueue::new(),
            dist_events_tx,
            dist_events: UnboundedReceiverStream::new(dist_events),
            handle,
            command_rx: UnboundedReceiverStream::new(command_rx),
            metrics: RetrieveMetrics::default(),
            shutdown,
        }
    }

    /// Returns a new [`RetrieveHandle`] that can send commands to this type.
    pub fn handle(&self) -> RetrieveHandle {
        self.handle.clone()
    }

    /// Number of retrievals in progress.
    pub fn num_active(&self) -> usize {
        self.retrievals.len()
    }

    fn on_submit(&mut self, submission: Submission) {
        let Submission { id, capability, encoded, deadline, request } = submission;
        if request.is_canceled() {
            return
        }
        trace!(target: "net::light::retrieve", id, kind=%encoded.kind, "new retrieval");

        let can_send: CanSendFn = Box::new(move |peer| peer.satisfies(&capability));
        let send: SendFn = Box::new(move |peer| peer.send_request(id, &encoded));
        let dist = DistRequest::new(id, can_send, send, deadline, self.dist_events_tx.clone());

        let deadline = self.timers.insert_at(Timer::Deadline(id), deadline);
        let retrieval = ActiveRetrieval {
            request,
            deadline,
            attempt: None,
            tried: HashSet::new(),
            early_response: None,
        };
        self.retrievals.insert(id, retrieval);
        self.distributor.queue(dist);
    }

    fn on_dist_event(&mut self, id: RequestId, event: DistEvent) {
        let Some(retrieval) = self.retrievals.get_mut(&id) else { return };
        if retrieval.request.is_canceled() {
            self.cancel(id);
            return
        }

        match event {
            DistEvent::Dispatched { peer } => {
                retrieval.tried.insert(peer.id());
                let timeout = self.config.request_timeout(peer.rtt());
                trace!(target: "net::light::retrieve", id, peer=?peer.id(), ?timeout, "request sent");
                let key = self.timers.insert(Timer::Attempt(id), timeout);
                let attempt = Attempt { peer, sent_at: Instant::now(), timeout: key };
                let peer_id = attempt.peer.id();
                if let Some(previous) = retrieval.attempt.replace(attempt) {
                    self.timers.remove(&previous.timeout);
                }
                match retrieval.early_response.take() {
                    Some((from, payload)) if from == peer_id => self.on_deliver(from, id, payload),
                    Some((from, _)) => {
                        trace!(target: "net::light::retrieve", id, ?from, "discarding early response from unexpected server");
                    }
                    None => {}
                }
            }
            DistEvent::Requeued { peer_id } => {
                retrieval.early_response = None;
                if let Some(attempt) = retrieval.attempt.take() {
                    self.timers.remove(&attempt.timeout);
                    self.pool.on_request_failure(peer_id, ReputationChangeKind::Dropped);
                }
                debug!(target: "net::light::retrieve", id, ?peer_id, "server dropped during retrieval");
                if retrieval.tried.len() as u32 >= self.config.max_attempts {
                    self.give_up(id, AttemptError::PeerDropped, false);
                }
            }
            DistEvent::Dropped => self.give_up(id, AttemptError::PeerUnavailable, false),
        }
    }

    fn on_deliver(&mut self, peer_id: PeerId, id: RequestId, payload: Bytes) {
        let Some(retrieval) = self.retrievals.get_mut(&id) else {
            trace!(target: "net::light::retrieve", id, ?peer_id, "response for unknown retrieval");
            return
        };
        let attempt = match retrieval.attempt.take() {
            Some(attempt) if attempt.peer.id() == peer_id => attempt,
            None => {
                // the distributor hands the request to the server before it reports the dispatch
                trace!(target: "net::light::retrieve", id, ?peer_id, "response before dispatch, buffering");
                retrieval.early_response = Some((peer_id, payload));
                return
            }
            other => {
                trace!(target: "net::light::retrieve", id, ?peer_id, "response from unexpected server");
                retrieval.attempt = other;
                return
            }
        };
        self.timers.remove(&attempt.timeout);

        match retrieval.request.verify(&payload) {
            Ok(()) => {
                let rtt = attempt.sent_at.elapsed();
                attempt.peer.update_rtt(rtt);
                self.pool.on_request_success(peer_id, rtt);
                self.distributor.complete(id);
                self.take_retrieval(id, false);
                self.metrics.successful_retrievals.increment(1);
                trace!(target: "net::light::retrieve", id, ?peer_id, ?rtt, "retrieval finished");
            }
            Err(err) => {
                self.metrics.verification_failures.increment(1);
                self.fail_attempt(id, attempt, err.into());
            }
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Deadline(id) => self.give_up(id, AttemptError::Timeout, true),
            Timer::Attempt(id) => {
                let Some(attempt) = self.retrievals.get_mut(&id).and_then(|r| r.attempt.take())
                else {
                    return
                };
                self.metrics.timeouts.increment(1);
                self.fail_attempt(id, attempt, AttemptError::Timeout);
            }
        }
    }

    /// Penalizes the server of the failed attempt and retries elsewhere, unless the attempt
    /// ceiling is reached.
    fn fail_attempt(&mut self, id: RequestId, attempt: Attempt, err: AttemptError) {
        let peer_id = attempt.peer.id();
        debug!(target: "net::light::retrieve", id, ?peer_id, %err, "attempt failed");
        let kind = match &err {
            AttemptError::Timeout => ReputationChangeKind::Timeout,
            AttemptError::VerificationFailed(_) => ReputationChangeKind::BadResponse,
            AttemptError::PeerDropped | AttemptError::PeerUnavailable => {
                ReputationChangeKind::Dropped
            }
        };
        self.pool.on_request_failure(peer_id, kind);

        let Some(retrieval) = self.retrievals.get(&id) else { return };
        if retrieval.tried.len() as u32 >= self.config.max_attempts {
            self.give_up(id, err, false);
        } else {
            self.distributor.retry(id, peer_id);
        }
    }

    /// Removes the retrieval and its timers.
    ///
    /// `deadline_expired` must be set if the deadline timer was already yielded by the queue.
    fn take_retrieval(&mut self, id: RequestId, deadline_expired: bool) -> Option<ActiveRetrieval> {
        let retrieval = self.retrievals.remove(&id)?;
        if !deadline_expired {
            self.timers.remove(&retrieval.deadline);
        }
        if let Some(attempt) = &retrieval.attempt {
            self.timers.remove(&attempt.timeout);
        }
        Some(retrieval)
    }

    fn give_up(&mut self, id: RequestId, reason: AttemptError, deadline_expired: bool) {
        let Some(mut retrieval) = self.take_retrieval(id, deadline_expired) else { return };
        self.distributor.cancel(id);
        let attempts = retrieval.tried.len() as u32;
        debug!(target: "net::light::retrieve", id, attempts, %reason, "retrieval exhausted");
        self.metrics.exhausted_retrievals.increment(1);
        retrieval.request.fail(RetrieveError::RetrievalExhausted { attempts });
    }

    fn cancel(&mut self, id: RequestId) {
        let Some(mut retrieval) = self.take_retrieval(id, false) else { return };
        trace!(target: "net::light::retrieve", id, "retrieval canceled");
        self.distributor.cancel(id);
        retrieval.request.fail(RetrieveError::Canceled);
    }

    fn on_command(&mut self, cmd: RetrieveCommand) {
        match cmd {
            RetrieveCommand::Submit(submission) => self.on_submit(submission),
            RetrieveCommand::Cancel(id) => self.cancel(id),
            RetrieveCommand::Deliver { peer_id, id, payload } => {
                self.on_deliver(peer_id, id, payload)
            }
        }
    }

    fn on_shutdown(&mut self) {
        debug!(target: "net::light::retrieve", active=self.retrievals.len(), "retrieve manager shutting down");
        for (_, mut retrieval) in self.retrievals.drain() {
            retrieval.request.fail(RetrieveError::Shutdown);
        }
        self.timers.clear();
        self.metrics.active_retrievals.set(0.0);
    }
}

impl Future for RetrieveManager {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.shutdown.poll_unpin(cx).is_ready() {
            this.on_shutdown();
            return Poll::Ready(())
        }

        loop {
            let mut progress = false;

            // distributor events first, a response is only accepted from the server the request
            // was dispatched to
            while let Poll::Ready(Some((id, event))) = this.dist_events.poll_next_unpin(cx) {
                this.on_dist_event(id, event);
                progress = true;
            }

            while let Poll::Ready(Some(cmd)) = this.command_rx.poll_next_unpin(cx) {
                this.on_command(cmd);
                progress = true;
            }

            while let Poll::Ready(Some(expired)) = this.timers.poll_expired(cx) {
                this.on_timer(expired.into_inner());
                progress = true;
            }

            if !progress {
                break
            }
        }

        this.metrics.active_retrievals.set(this.retrievals.len() as f64);
        Poll::Pending
    }
}

impl fmt::Debug for RetrieveManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveManager")
            .field("config", &self.config)
            .field("retrievals", &self.retrievals)
            .finish_non_exhaustive()
    }
}

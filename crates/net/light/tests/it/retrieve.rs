use crate::{code_request, known_server, spawn_odr};
use alloy_primitives::Bytes;
use assert_matches::assert_matches;
use reth_light::{
    test_utils::{test_peer, test_peer_with_rtt, MockConnection, SentMessage},
    RetrieveError,
};
use reth_light_types::{LightConfig, PeerId, RetrieveConfig, DEFAULT_REPUTATION};
use std::time::Duration;
use tokio::time::Instant;

const CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0x52];

#[tokio::test(start_paused = true)]
async fn no_peers_exhausts_at_deadline() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let start = Instant::now();
    let res = odr.retrieve().submit_with_deadline(code_request(CODE), Duration::from_secs(2)).await;
    assert_eq!(res, Err(RetrieveError::RetrievalExhausted { attempts: 0 }));
    // timers have millisecond resolution
    assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(5));
}

#[tokio::test(start_paused = true)]
async fn bad_response_from_only_peer_exhausts() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let (conn, mut sent) = MockConnection::new();
    let peer = odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();
    known_server(odr.pool(), peer.id()).await;

    let pending = odr.retrieve().submit(code_request(CODE));
    let id = assert_matches!(sent.recv().await, Some(SentMessage::Request { id, .. }) => id);
    assert_eq!(id, pending.id());
    odr.retrieve().deliver(peer.id(), id, Bytes::from_static(b"not the code"));

    assert_eq!(pending.await, Err(RetrieveError::RetrievalExhausted { attempts: 1 }));
    // the retry found no other server, nothing else was sent
    assert!(sent.try_recv().is_err());
    assert_eq!(peer.outstanding(), 0);

    let server = known_server(odr.pool(), peer.id()).await;
    assert_eq!(server.reputation.failures(), 1);
    assert!(server.reputation.reputation() < DEFAULT_REPUTATION);
}

#[tokio::test(start_paused = true)]
async fn timeout_retries_with_next_peer() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    // the faster server is picked first
    let (slow_conn, mut slow_sent) = MockConnection::new();
    let (fast_conn, mut fast_sent) = MockConnection::new();
    let slow = odr
        .peers()
        .register(test_peer_with_rtt(PeerId::random(), slow_conn, Duration::from_millis(200)))
        .unwrap();
    let fast = odr
        .peers()
        .register(test_peer_with_rtt(PeerId::random(), fast_conn, Duration::from_millis(50)))
        .unwrap();
    known_server(odr.pool(), slow.id()).await;
    known_server(odr.pool(), fast.id()).await;

    let start = Instant::now();
    let pending = odr.retrieve().submit(code_request(CODE));
    assert_matches!(fast_sent.recv().await, Some(SentMessage::Request { .. }));

    // the fast server never answers, the request moves on after its timeout
    let id = assert_matches!(slow_sent.recv().await, Some(SentMessage::Request { id, .. }) => id);
    assert!(start.elapsed() >= Duration::from_secs(1));
    odr.retrieve().deliver(slow.id(), id, Bytes::from_static(CODE));

    assert_eq!(pending.await, Ok(Bytes::from_static(CODE)));
    assert_eq!(fast.outstanding(), 0);
    assert_eq!(slow.outstanding(), 0);

    let timed_out = known_server(odr.pool(), fast.id()).await;
    assert_eq!(timed_out.reputation.consecutive_failures(), 1);
    assert!(timed_out.reputation.backoff_until() > 0);

    let served = known_server(odr.pool(), slow.id()).await;
    assert_eq!(served.reputation.successes(), 1);
    assert!(served.reputation.reputation() > DEFAULT_REPUTATION);
    assert!(served.last_rtt.is_some());
}

#[tokio::test(start_paused = true)]
async fn disconnect_requeues_to_other_peer() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let (first_conn, mut first_sent) = MockConnection::new();
    let (second_conn, mut second_sent) = MockConnection::new();
    let first = odr
        .peers()
        .register(test_peer_with_rtt(PeerId::random(), first_conn, Duration::from_millis(50)))
        .unwrap();
    let second = odr
        .peers()
        .register(test_peer_with_rtt(PeerId::random(), second_conn, Duration::from_millis(80)))
        .unwrap();
    known_server(odr.pool(), first.id()).await;

    let pending = odr.retrieve().submit(code_request(CODE));
    assert_matches!(first_sent.recv().await, Some(SentMessage::Request { .. }));

    odr.peers().unregister(&first.id());
    let id = assert_matches!(second_sent.recv().await, Some(SentMessage::Request { id, .. }) => id);

    // a late answer of the dropped server is ignored
    odr.retrieve().deliver(first.id(), id, Bytes::from_static(b"stale"));
    odr.retrieve().deliver(second.id(), id, Bytes::from_static(CODE));
    assert_eq!(pending.await, Ok(Bytes::from_static(CODE)));
    assert_eq!(second.outstanding(), 0);

    // losing the server mid request counts as a failure
    let dropped = known_server(odr.pool(), first.id()).await;
    assert_eq!(dropped.reputation.failures(), 1);
    assert!(dropped.reputation.reputation() < DEFAULT_REPUTATION);
}

#[tokio::test(start_paused = true)]
async fn verified_retrieval_updates_rtt() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let (conn, mut sent) = MockConnection::new();
    let peer = odr
        .peers()
        .register(test_peer_with_rtt(PeerId::random(), conn, Duration::from_millis(500)))
        .unwrap();

    let pending = odr.retrieve().submit(code_request(CODE));
    let id = assert_matches!(sent.recv().await, Some(SentMessage::Request { id, .. }) => id);
    tokio::time::sleep(Duration::from_millis(10)).await;
    odr.retrieve().deliver(peer.id(), id, Bytes::from_static(CODE));

    assert_eq!(pending.await, Ok(Bytes::from_static(CODE)));
    assert!(peer.rtt() < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_outstanding_retrievals() {
    let (odr, signal) = spawn_odr(LightConfig::default());

    let (conn, mut sent) = MockConnection::new();
    let peer = odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();

    let pending = odr.retrieve().submit(code_request(CODE));
    assert_matches!(sent.recv().await, Some(SentMessage::Request { .. }));

    signal.fire();
    assert_eq!(pending.await, Err(RetrieveError::Shutdown));

    // submissions after shutdown resolve immediately
    let res = odr.retrieve().retrieve(code_request(CODE)).await;
    assert_eq!(res, Err(RetrieveError::Shutdown));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!peer.is_alive());
    assert!(odr.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn attempts_never_exceed_ceiling() {
    let config = LightConfig {
        retrieve: RetrieveConfig::default().with_max_attempts(2),
        ..Default::default()
    };
    let (odr, _signal) = spawn_odr(config);

    let mut servers = Vec::new();
    for rtt in [50, 80, 120] {
        let (conn, sent) = MockConnection::new();
        let peer = odr
            .peers()
            .register(test_peer_with_rtt(PeerId::random(), conn, Duration::from_millis(rtt)))
            .unwrap();
        servers.push((peer, sent));
    }

    let pending = odr.retrieve().submit(code_request(CODE));
    for (peer, sent) in servers.iter_mut().take(2) {
        let id = assert_matches!(sent.recv().await, Some(SentMessage::Request { id, .. }) => id);
        odr.retrieve().deliver(peer.id(), id, Bytes::from_static(b"junk"));
    }

    assert_eq!(pending.await, Err(RetrieveError::RetrievalExhausted { attempts: 2 }));
    let (third, sent) = &mut servers[2];
    assert!(sent.try_recv().is_err());
    assert_eq!(third.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn long_deadline_is_capped() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let (conn, mut sent) = MockConnection::new();
    let peer = odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();

    let first = odr.retrieve().submit(code_request(CODE));
    let id = assert_matches!(sent.recv().await, Some(SentMessage::Request { id, .. }) => id);

    let years = odr
        .retrieve()
        .submit_with_deadline(code_request(b"other"), Duration::from_secs(5 * 365 * 24 * 60 * 60));
    let forever = odr.retrieve().submit_with_deadline(code_request(b"more"), Duration::MAX);

    odr.retrieve().deliver(peer.id(), id, Bytes::from_static(CODE));
    assert_eq!(first.await, Ok(Bytes::from_static(CODE)));

    odr.retrieve().cancel(years.id());
    odr.retrieve().cancel(forever.id());
    assert_eq!(years.await, Err(RetrieveError::Canceled));
    assert_eq!(forever.await, Err(RetrieveError::Canceled));
}

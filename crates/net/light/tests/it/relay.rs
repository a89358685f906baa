use crate::spawn_odr;
use alloy_primitives::Bytes;
use reth_light::test_utils::{test_peer, MockConnection, SentMessage};
use reth_light_types::{LightConfig, PeerId, TxHash};
use std::time::Duration;

fn tx(n: u8) -> (TxHash, Bytes) {
    (TxHash::with_last_byte(n), Bytes::from(vec![0xf8, n]))
}

#[tokio::test(start_paused = true)]
async fn pending_tx_sent_once_to_joining_peer() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    odr.relay().submit(vec![tx(1)]);
    assert_eq!(odr.relay().pending().await, vec![tx(1).0]);

    let (conn, mut sent) = MockConnection::new();
    odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();

    assert_eq!(sent.recv().await, Some(SentMessage::Transactions(vec![tx(1).1])));

    // resubmitting a known transaction does not resend it
    odr.relay().submit(vec![tx(1)]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rejoining_peer_receives_pending_again() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    let id = PeerId::random();
    let (conn, mut sent) = MockConnection::new();
    odr.peers().register(test_peer(id, conn.clone())).unwrap();
    odr.relay().submit(vec![tx(1), tx(2)]);
    assert_eq!(sent.recv().await, Some(SentMessage::Transactions(vec![tx(1).1, tx(2).1])));

    odr.relay().notify_mined(vec![tx(1).0]);
    assert_eq!(odr.relay().pending().await, vec![tx(2).0]);
    odr.peers().unregister(&id);
    odr.peers().register(test_peer(id, conn)).unwrap();

    assert_eq!(sent.recv().await, Some(SentMessage::Transactions(vec![tx(2).1])));
}

#[tokio::test(start_paused = true)]
async fn discard_and_mined_are_idempotent() {
    let (odr, _signal) = spawn_odr(LightConfig::default());

    odr.relay().submit(vec![tx(1), tx(2), tx(3)]);
    odr.relay().discard(tx(1).0);
    odr.relay().discard(tx(1).0);
    odr.relay().notify_mined(vec![tx(2).0, tx(2).0, tx(9).0]);
    odr.relay().notify_mined(vec![tx(2).0]);
    assert_eq!(odr.relay().pending().await, vec![tx(3).0]);

    let (conn, mut sent) = MockConnection::new();
    odr.peers().register(test_peer(PeerId::random(), conn)).unwrap();
    assert_eq!(sent.recv().await, Some(SentMessage::Transactions(vec![tx(3).1])));

    odr.relay().notify_mined(vec![tx(3).0]);
    assert!(odr.relay().pending().await.is_empty());
}

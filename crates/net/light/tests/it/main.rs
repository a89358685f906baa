//! Root module for test modules, so that the tests are built into a single binary.

#![allow(missing_docs)]

use alloy_primitives::{keccak256, Bytes, B256};
use futures::StreamExt;
use reth_light::{
    LightOdr, MemoryReputationStore, ProofRequest, ServerInfo, ServerPoolHandle, Signal,
    StaticDiscovery, VerifyError,
};
use reth_light_types::{LightConfig, PeerId, RequestKind};
use std::time::Duration;

mod relay;
mod retrieve;

const fn main() {}

/// Creates and spawns all services with an empty store and no discovery.
///
/// The pool's actions are drained and dropped.
fn spawn_odr(config: LightConfig) -> (LightOdr, Signal) {
    reth_light::test_utils::init_test_tracing();
    let (signal, shutdown) = reth_light::signal();
    let (odr, services) = LightOdr::new(
        config,
        Box::new(MemoryReputationStore::default()),
        Box::new(StaticDiscovery::default()),
        shutdown,
    );
    let mut pool = services.spawn();
    tokio::spawn(async move { while pool.next().await.is_some() {} });
    (odr, signal)
}

/// Requests contract code, which is verified against its hash.
fn code_request(code: &[u8]) -> ProofRequest<Bytes> {
    let code_hash = keccak256(code);
    ProofRequest::new(
        RequestKind::ContractCode,
        Bytes::copy_from_slice(code_hash.as_slice()),
        code_hash,
        |raw: &Bytes, root: B256| {
            if keccak256(raw) == root {
                Ok(raw.clone())
            } else {
                Err(VerifyError::new("code hash mismatch"))
            }
        },
    )
}

/// Waits until the pool learned about the server.
async fn known_server(pool: &ServerPoolHandle, peer_id: PeerId) -> ServerInfo {
    loop {
        if let Some(server) = pool.record(peer_id).await {
            return server
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

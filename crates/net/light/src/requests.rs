//! Requests that can be retrieved from light servers.

use crate::{error::VerifyError, peer::LightRequest};
use alloy_primitives::{Bytes, B256};
use reth_light_types::{Capability, RequestKind};
use std::{fmt, sync::Arc};

/// A request whose response can be verified without trusting the server.
///
/// The verifier must be a pure function of the request and the response, it may be called from
/// any task.
pub trait OdrRequest: Send + 'static {
    /// The verified value.
    type Output: Send + 'static;

    /// What a server needs to be able to serve this request.
    fn capability(&self) -> Capability;

    /// Encodes the request for the wire.
    fn encode(&self) -> LightRequest;

    /// Verifies a raw response and extracts the value.
    fn verify(&self, response: &Bytes) -> Result<Self::Output, VerifyError>;
}

/// Verifies a raw response against the root it claims to be proven by.
pub type Verifier<T> = Arc<dyn Fn(&Bytes, B256) -> Result<T, VerifyError> + Send + Sync>;

/// A request for data proven against a known root, e.g. an account against a state root or a
/// header against a canonical-hash index root.
pub struct ProofRequest<T> {
    kind: RequestKind,
    payload: Bytes,
    root: B256,
    min_head: u64,
    verifier: Verifier<T>,
}

impl<T> ProofRequest<T> {
    /// Creates a new request of the given kind.
    ///
    /// `payload` is the encoded request body, `root` is handed to the verifier together with the
    /// raw response.
    pub fn new<F>(kind: RequestKind, payload: Bytes, root: B256, verifier: F) -> Self
    where
        F: Fn(&Bytes, B256) -> Result<T, VerifyError> + Send + Sync + 'static,
    {
        Self { kind, payload, root, min_head: 0, verifier: Arc::new(verifier) }
    }

    /// Only servers whose head is at least this block can serve the request.
    ///
    /// Index proofs for example need a server that has indexed up to the section the proof
    /// belongs to.
    pub const fn with_min_head(mut self, min_head: u64) -> Self {
        self.min_head = min_head;
        self
    }

    /// The kind of the request.
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// The root the response is verified against.
    pub const fn root(&self) -> B256 {
        self.root
    }
}

impl<T> Clone for ProofRequest<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            payload: self.payload.clone(),
            root: self.root,
            min_head: self.min_head,
            verifier: Arc::clone(&self.verifier),
        }
    }
}

impl<T> fmt::Debug for ProofRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofRequest")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("root", &self.root)
            .field("min_head", &self.min_head)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> OdrRequest for ProofRequest<T> {
    type Output = T;

    fn capability(&self) -> Capability {
        Capability::new(self.kind).with_min_head(self.min_head)
    }

    fn encode(&self) -> LightRequest {
        LightRequest { kind: self.kind, payload: self.payload.clone() }
    }

    fn verify(&self, response: &Bytes) -> Result<T, VerifyError> {
        (self.verifier)(response, self.root)
    }
}

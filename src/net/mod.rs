//! Node-to-node RPC.
//!
//! Nodes talk through a [`Transport`], which delivers one [`Request`] to an
//! address and hands back the [`Response`]. Two transports exist: the QUIC
//! [`endpoint`] used by deployments and the in-process [`local`] network used
//! by tests and single-process demos. Both push every message through the
//! [`wire`] codec, so nodes never share memory.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    codec::Blob,
    identity::NodeIdentity,
    work::{ContextFrame, Contribution},
};

pub mod axon;
pub mod endpoint;
mod error;
pub mod local;
pub mod tls;
pub mod wire;

pub use error::TransportError;
pub use wire::{Request, Response};

/// Default UDP port nodes listen on: "ORBIT" in ascii, summed, times ten.
pub const ORBIT_PORT: u16 = 3840;

/// Delivers requests to peers by address.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, to: &str, request: Request) -> Result<Response, TransportError>;
}

/// Answers requests addressed to one node.
#[async_trait]
pub trait Service: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Typed, timeout-bounded access to remote nodes.
///
/// Can be cloned to obtain another handle to the same transport.
#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and fails with [`TransportError::TimedOut`] if no
    /// response arrives in time. A `Rejected` response becomes an error.
    pub async fn call(&self, to: &str, request: Request) -> Result<Response, TransportError> {
        let response = tokio::time::timeout(self.timeout, self.transport.call(to, request)).await??;
        match response {
            Response::Rejected(reason) => Err(TransportError::Rejected(reason)),
            other => Ok(other),
        }
    }

    pub async fn info(&self, to: &str) -> Result<NodeIdentity, TransportError> {
        match self.call(to, Request::Info).await? {
            Response::Info(identity) => Ok(identity),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub async fn queue_depth(&self, to: &str) -> Result<usize, TransportError> {
        self.depth(to, Request::QueueDepth).await
    }

    pub async fn regional_queue_depth(&self, to: &str) -> Result<usize, TransportError> {
        self.depth(to, Request::RegionalQueueDepth).await
    }

    async fn depth(&self, to: &str, request: Request) -> Result<usize, TransportError> {
        match self.call(to, request).await? {
            Response::Depth(depth) => Ok(depth as usize),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub async fn neighbor(&self, to: &str) -> Result<String, TransportError> {
        match self.call(to, Request::Neighbor).await? {
            Response::Neighbor(address) => Ok(address),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub async fn receive_blob(&self, to: &str, blob: Blob) -> Result<(), TransportError> {
        self.ack(to, Request::ReceiveBlob(blob)).await
    }

    pub async fn balance(&self, to: &str, blob: Blob) -> Result<(), TransportError> {
        self.ack(to, Request::Balance(blob)).await
    }

    pub async fn set_next(&self, to: &str, next: &str) -> Result<(), TransportError> {
        self.ack(to, Request::SetNext(next.into())).await
    }

    pub async fn set_regional_next(&self, to: &str, next: &str) -> Result<(), TransportError> {
        self.ack(to, Request::SetRegionalNext(next.into())).await
    }

    async fn ack(&self, to: &str, request: Request) -> Result<(), TransportError> {
        match self.call(to, request).await? {
            Response::Ack => Ok(()),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub async fn run(
        &self,
        to: &str,
        context: ContextFrame,
        selector: Vec<String>,
    ) -> Result<Option<ContextFrame>, TransportError> {
        match self.call(to, Request::Run { context, selector }).await? {
            Response::Ran(frame) => Ok(frame),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub async fn contribute(
        &self,
        to: &str,
        context: ContextFrame,
        selector: Vec<String>,
    ) -> Result<Option<Vec<Contribution>>, TransportError> {
        match self.call(to, Request::Contribute { context, selector }).await? {
            Response::Contribution(contributions) => Ok(contributions),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::trace;

use super::{Request, Response, Service, Transport, TransportError};

/// An in-process network of services keyed by address.
///
/// Requests and responses are pushed through the wire codec on every call, so
/// nodes sharing a `LocalNetwork` behave as if they were remote. Addresses can
/// be taken down to simulate unreachable peers.
#[derive(Default)]
pub struct LocalNetwork {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    down: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: impl Into<String>, service: Arc<dyn Service>) {
        self.services.write().insert(address.into(), service);
    }

    pub fn deregister(&self, address: &str) {
        self.services.write().remove(address);
    }

    /// Makes calls to `address` fail with [`TransportError::Unreachable`]
    /// until it is brought back up.
    pub fn take_down(&self, address: &str) {
        self.down.write().insert(address.to_string());
    }

    pub fn bring_up(&self, address: &str) {
        self.down.write().remove(address);
    }

    pub fn addresses(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn call(&self, to: &str, request: Request) -> Result<Response, TransportError> {
        if self.down.read().contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        let service = self
            .services
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
        trace!(to, request = request.name(), "local call");
        let request = Request::decode_frame(&request.encode()?)?;
        let response = service.handle(request).await;
        Response::decode_frame(&response.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::SetNext(next) => Response::Neighbor(next),
                _ => Response::Rejected("echo only understands set_next".into()),
            }
        }
    }

    #[tokio::test]
    async fn calls_reach_registered_services() {
        let net = LocalNetwork::new();
        net.register("echo", Arc::new(Echo));
        match net.call("echo", Request::SetNext("b".into())).await.unwrap() {
            Response::Neighbor(next) => assert_eq!(next, "b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn downed_and_unknown_addresses_are_unreachable() {
        let net = LocalNetwork::new();
        net.register("echo", Arc::new(Echo));
        net.take_down("echo");
        assert!(matches!(
            net.call("echo", Request::Info).await,
            Err(TransportError::Unreachable(_))
        ));
        net.bring_up("echo");
        assert!(net.call("echo", Request::Info).await.is_ok());
        assert!(matches!(
            net.call("nobody", Request::Info).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}

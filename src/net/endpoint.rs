use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use quinn::VarInt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    axon::Axon,
    error::TransportError,
    tls::{client_config, TlsMaterial},
    Request, Response, Service, Transport,
};

/// Name presented in the TLS handshake. Certificates are not verified, so
/// any valid DNS name does.
const SERVER_NAME: &str = "orbit";

/// A QUIC endpoint. It serves one node's [`Service`] to inbound links and,
/// as a [`Transport`], calls out to other nodes over cached axons.
pub struct Endpoint {
    ep: quinn::Endpoint,
    axons: Arc<RwLock<HashMap<SocketAddr, Axon>>>,
}

impl Endpoint {
    /// Binds `addr` and starts answering inbound requests with `service`.
    pub fn bind(addr: SocketAddr, tls: &TlsMaterial, service: Arc<dyn Service>) -> io::Result<Self> {
        let server_tls = tls
            .server_config()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(Self::transport_config());

        let mut ep = quinn::Endpoint::server(server_config, addr)?;
        ep.set_default_client_config(Self::client_config());
        tokio::spawn(Self::start_acceptor(ep.clone(), service));
        debug!(%addr, "endpoint bound");
        Ok(Self {
            ep,
            axons: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// An endpoint that only makes outbound calls, bound to an ephemeral port.
    pub fn client() -> io::Result<Self> {
        let mut ep = quinn::Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        ep.set_default_client_config(Self::client_config());
        Ok(Self {
            ep,
            axons: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.ep.local_addr()
    }

    /// Closes every connection and stops accepting new ones.
    pub fn close(&self) {
        self.ep.close(VarInt::from_u32(0), b"shutdown");
    }

    // shared transport configuration for the server and client sides
    // this is the default config with the BBR congestion controller enabled
    fn transport_config() -> Arc<quinn::TransportConfig> {
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        Arc::new(transport_config)
    }

    fn client_config() -> quinn::ClientConfig {
        let mut client_config = quinn::ClientConfig::new(Arc::new(client_config()));
        client_config.transport_config(Self::transport_config());
        client_config
    }

    /// Accepts incoming connections and spawns a task to serve each one.
    /// Runs until the endpoint is closed.
    async fn start_acceptor(ep: quinn::Endpoint, service: Arc<dyn Service>) {
        while let Some(in_progress) = ep.accept().await {
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = Axon::serve(in_progress, service).await {
                    debug!(error = %e, "inbound link failed");
                }
            });
        }
        debug!("acceptor stopped");
    }

    async fn resolve(to: &str) -> Result<SocketAddr, TransportError> {
        if let Ok(addr) = to.parse() {
            return Ok(addr);
        }
        tokio::net::lookup_host(to)
            .await
            .map_err(|_| TransportError::BadAddress(to.to_string()))?
            .next()
            .ok_or_else(|| TransportError::BadAddress(to.to_string()))
    }

    /// Returns the cached axon to `addr`, connecting if there is none or the
    /// cached one has died.
    async fn axon(&self, addr: SocketAddr) -> Result<Axon, TransportError> {
        if let Some(axon) = self.axons.read().await.get(&addr) {
            if !axon.is_closed() {
                return Ok(axon.clone());
            }
        }
        let axon = Axon::connect(self.ep.connect(addr, SERVER_NAME)?).await?;
        self.axons.write().await.insert(addr, axon.clone());
        Ok(axon)
    }
}

#[async_trait]
impl Transport for Endpoint {
    async fn call(&self, to: &str, request: Request) -> Result<Response, TransportError> {
        let addr = Self::resolve(to).await?;
        let axon = self.axon(addr).await?;
        match axon.request(&request).await {
            Ok(response) => Ok(response),
            Err(e @ TransportError::Connection(_)) => {
                warn!(%addr, error = %e, "dropping dead axon");
                self.axons.write().await.remove(&addr);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

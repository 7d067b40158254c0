use std::{net::SocketAddr, sync::Arc};

use quinn::{Connecting, ConnectionError, RecvStream, SendStream};
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    error::TransportError,
    wire::{parse_header, HEADER_LEN},
    Request, Response, Service,
};

/// Axons are the QUIC links between nodes. Every request travels on its own
/// bidirectional stream, so one slow call never blocks another.
///
/// Can be cloned to obtain another handle to the same axon.
#[derive(Clone)]
pub struct Axon {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Axon {
    /// Completes an outbound connection.
    pub async fn connect(in_progress: Connecting) -> Result<Self, TransportError> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("axon", remote = %remote_addr);
        async move {
            debug!("establishing QUIC connection");
            let conn = in_progress.await?;
            debug!("connected via QUIC");
            Ok(Axon { conn, remote_addr })
        }
        .instrument(span)
        .await
    }

    /// Sends one request and waits for its response.
    pub async fn request(&self, request: &Request) -> Result<Response, TransportError> {
        let (mut send, mut recv) = self.conn.open_bi().await?;
        send.write_all(&request.encode()?).await?;
        send.finish().await?;
        let (flags, body) = read_frame(&mut recv).await?;
        Response::decode(flags, &body)
    }

    /// Whether the underlying connection has been closed for any reason.
    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Accepts an inbound connection and answers every stream the peer opens
    /// on it with `service`, until the peer goes away.
    pub async fn serve(in_progress: Connecting, service: Arc<dyn Service>) -> Result<(), TransportError> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("axon", remote = %remote_addr);
        async move {
            let conn = in_progress.await?;
            debug!("accepted QUIC connection");
            loop {
                let (send, recv) = match conn.accept_bi().await {
                    Ok(streams) => streams,
                    Err(ConnectionError::ApplicationClosed(_))
                    | Err(ConnectionError::LocallyClosed)
                    | Err(ConnectionError::TimedOut) => {
                        debug!("connection closed");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                let service = service.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = answer(send, recv, service).await {
                            debug!(error = %e, "stream failed");
                        }
                    }
                    .in_current_span(),
                );
            }
        }
        .instrument(span)
        .await
    }
}

async fn answer(
    mut send: SendStream,
    mut recv: RecvStream,
    service: Arc<dyn Service>,
) -> Result<(), TransportError> {
    let (flags, body) = read_frame(&mut recv).await?;
    let response = match Request::decode(flags, &body) {
        Ok(request) => {
            trace!(request = request.name(), "inbound request");
            service.handle(request).await
        }
        Err(_) => Response::Rejected("undecodable request".into()),
    };
    send.write_all(&response.encode()?).await?;
    send.finish().await?;
    Ok(())
}

async fn read_frame(recv: &mut RecvStream) -> Result<(u8, Vec<u8>), TransportError> {
    let mut header = [0u8; HEADER_LEN];
    recv.read_exact(&mut header).await?;
    let (flags, len) = parse_header(&header)?;
    let mut body = vec![0u8; len];
    recv.read_exact(&mut body).await?;
    Ok((flags, body))
}

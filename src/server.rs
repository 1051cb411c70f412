use crate::exchange::{HttpExchange, RawRequest, RequestError};
use crate::forward::ForwardHandler;
use crate::tunnel::TunnelHandler;
use bytes::Bytes;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept loop dispatching `CONNECT` to the tunnel handler and everything
/// else to the forward handler
pub struct ProxyServer {
    tunnel: Arc<TunnelHandler>,
    forward: Arc<ForwardHandler>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(tunnel: Arc<TunnelHandler>, forward: Arc<ForwardHandler>, shutdown: CancellationToken) -> Self {
        Self {
            tunnel,
            forward,
            shutdown,
        }
    }

    /// Accept until the shutdown token is cancelled. Connections already
    /// accepted keep running on their own tasks.
    pub async fn run(&self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay for {}: {}", peer_addr, e);
                    }
                    let tunnel = Arc::clone(&self.tunnel);
                    let forward = Arc::clone(&self.forward);
                    tokio::task::spawn(async move {
                        handle_connection(tunnel, forward, stream, Some(peer_addr)).await;
                    });
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
        info!("Listener stopped accepting connections");
    }
}

/// Read the first request off `stream` and hand the connection to the
/// matching handler
pub async fn handle_connection<S>(
    tunnel: Arc<TunnelHandler>,
    forward: Arc<ForwardHandler>,
    stream: S,
    peer: Option<SocketAddr>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut exchange = HttpExchange::new(stream, Bytes::new());

    let req = match exchange.read_request().await {
        Ok(Some(req)) => req,
        Ok(None) => {
            debug!("{:?} closed without sending a request", peer);
            return;
        }
        Err(e @ (RequestError::Io(_) | RequestError::Incomplete)) => {
            debug!("Reading request from {:?}: {}", peer, e);
            return;
        }
        Err(e) => {
            warn!("Bad request from {:?}: {}", peer, e);
            let status = match e {
                RequestError::HeadTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                RequestError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            if let Err(write_err) = exchange.write_error(status, &e.to_string()).await {
                debug!("Answering bad request from {:?}: {}", peer, write_err);
            }
            return;
        }
    };

    if req.method() == Method::CONNECT {
        // failures are logged by the handler
        if let Ok(summary) = tunnel.serve(&mut exchange, &req, peer).await {
            info!(
                "Tunnel #{}: {}{} closed after {:?}, {}↑ {}↓ bytes",
                summary.id,
                summary.target_addr,
                if summary.is_cascade { " (cascade)" } else { "" },
                summary.duration,
                summary.client_to_target,
                summary.target_to_client
            );
        }
        return;
    }

    let Some(raw) = req.extensions().get::<RawRequest>().cloned() else {
        return;
    };
    if let Some(stream) = exchange.into_replay(&raw) {
        forward.serve_connection(stream, peer).await;
    }
}

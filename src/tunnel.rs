use crate::addr::{host_and_port, strip_userinfo};
use crate::buffer_pool::BufferPool;
use crate::conn_pool::{ConnContainer, TargetConn};
use crate::connection::{TunnelGuard, TunnelLimiter};
use crate::dial::{BoxedConnection, Dialer, TcpDialer};
use crate::error::TunnelError;
use crate::exchange::{request_bytes, HttpExchange};
use crate::relay::{relay, RelayOptions, Relayed};
use crate::selector::ProxySelector;
use crate::session::TunnelSession;
use crate::traffic::TrafficCounters;
use bytes::Bytes;
use http::{Request, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sent to the client once a direct tunnel is ready
pub const TUNNEL_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Sent to the client when no usable tunnel could be set up
pub const TUNNEL_FAIL: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Write the tunnel failure line and close the client
pub async fn tunnel_fail<C>(mut client: C)
where
    C: AsyncWrite + Unpin,
{
    if let Err(e) = client.write_all(TUNNEL_FAIL).await {
        debug!("writing tunnel failure: {}", e);
    }
    if let Err(e) = client.shutdown().await {
        debug!("closing client after tunnel failure: {}", e);
    }
}

/// Long-lived, read-only settings shared by every session of a handler
#[derive(Clone, Default)]
pub struct TunnelContext {
    pub selector: Option<Arc<dyn ProxySelector>>,
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Governs every dial issued through this context
    pub cancel: CancellationToken,
}

impl TunnelContext {
    pub fn with_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fresh connection to `addr`: the configured dialer, else plain TCP.
    /// Either way the dial stops when the context is cancelled.
    pub async fn dial(&self, addr: &str) -> io::Result<BoxedConnection> {
        match &self.dialer {
            Some(dialer) => dialer.dial(addr, &self.cancel).await,
            None => TcpDialer::default().dial(addr, &self.cancel).await,
        }
    }

    /// Decide where a request goes
    pub fn resolve_target(&self, req: &Request<Bytes>) -> Result<Target, TunnelError> {
        if let Some(selector) = &self.selector {
            if let Some(upstream) = selector.select(req).map_err(TunnelError::Resolution)? {
                let authority = upstream.authority().ok_or_else(|| {
                    TunnelError::Resolution(format!("upstream {} names no host", upstream).into())
                })?;
                return Ok(Target {
                    addr: host_and_port(strip_userinfo(authority.as_str())),
                    cascade: true,
                });
            }
        }

        let requested = requested_authority(req)
            .ok_or_else(|| TunnelError::Resolution("request names no target host".into()))?;
        Ok(Target {
            addr: host_and_port(&requested),
            cascade: false,
        })
    }
}

/// Host the client asked for: the request target, else the `Host` header
fn requested_authority(req: &Request<Bytes>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    let host = req.headers().get(http::header::HOST)?.to_str().ok()?.trim();
    (!host.is_empty()).then(|| host.to_string())
}

/// Resolved destination of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Normalized `host:port` to connect to
    pub addr: String,
    /// `addr` is an upstream proxy that must see the original request
    pub cascade: bool,
}

/// Outcome of a tunnel that was established and has ended
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub id: String,
    pub target_addr: String,
    pub is_cascade: bool,
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub duration: Duration,
}

/// Serves `CONNECT` requests: hijack, resolve, connect, handshake, relay, reclaim
pub struct TunnelHandler {
    ctx: TunnelContext,
    buffer_pool: Arc<dyn BufferPool>,
    conn_container: Option<Arc<dyn ConnContainer>>,
    relay: RelayOptions,
    limiter: Arc<TunnelLimiter>,
    traffic: Arc<TrafficCounters>,
}

impl TunnelHandler {
    pub fn new(ctx: TunnelContext, buffer_pool: Arc<dyn BufferPool>) -> Self {
        Self {
            ctx,
            buffer_pool,
            conn_container: None,
            relay: RelayOptions::default(),
            limiter: Arc::new(TunnelLimiter::unlimited()),
            traffic: Arc::new(TrafficCounters::default()),
        }
    }

    pub fn with_conn_container(mut self, container: Arc<dyn ConnContainer>) -> Self {
        self.conn_container = Some(container);
        self
    }

    pub fn with_relay_options(mut self, options: RelayOptions) -> Self {
        self.relay = options;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<TunnelLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_traffic(mut self, traffic: Arc<TrafficCounters>) -> Self {
        self.traffic = traffic;
        self
    }

    /// Run one tunnel session to completion.
    ///
    /// Failures before the tunnel exists are answered on the hijacked socket
    /// with [`TUNNEL_FAIL`]; a failed hijack is answered through the exchange.
    pub async fn serve<S>(
        &self,
        exchange: &mut HttpExchange<S>,
        req: &Request<Bytes>,
        peer: Option<SocketAddr>,
    ) -> Result<TunnelSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = TunnelSession::new(peer);

        let mut client = match exchange.hijack() {
            Ok(client) => client,
            Err(e) => {
                warn!("Tunnel #{}: {}", session.id, e);
                if let Err(write_err) = exchange.write_error(StatusCode::BAD_GATEWAY, &e.to_string()).await {
                    debug!("Tunnel #{}: reporting hijack failure: {}", session.id, write_err);
                }
                return Err(e.into());
            }
        };

        let (_guard, target) = match self.open(&mut session, &mut client, req).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Tunnel #{}: {}", session.id, e);
                tunnel_fail(client).await;
                return Err(e);
            }
        };

        info!(
            "Tunnel #{}: {} -> {}{}",
            session.id,
            session.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            session.target_addr().unwrap_or_default(),
            if session.is_cascade() { " (cascade)" } else { "" }
        );
        if !client.buffered().is_empty() {
            debug!("Tunnel #{}: {} bytes arrived with the request", session.id, client.buffered().len());
        }

        let Relayed {
            client,
            target,
            client_to_target,
            target_to_client,
        } = relay(client, target, Arc::clone(&self.buffer_pool), &self.relay)
            .await
            .map_err(|e| {
                warn!("Tunnel #{}: {}", session.id, e);
                TunnelError::Relay(e)
            })?;

        self.reclaim(target).await;
        // the relay already half-closed the client; dropping it releases the socket
        drop(client);

        self.traffic.record_tunnel(client_to_target, target_to_client);

        Ok(TunnelSummary {
            target_addr: session.target_addr().unwrap_or_default().to_string(),
            id: session.id.clone(),
            is_cascade: session.is_cascade(),
            client_to_target,
            target_to_client,
            duration: session.age(),
        })
    }

    /// Everything between hijack and relay. The returned connection has
    /// seen the handshake.
    async fn open<C>(
        &self,
        session: &mut TunnelSession,
        client: &mut C,
        req: &Request<Bytes>,
    ) -> Result<(TunnelGuard, TargetConn), TunnelError>
    where
        C: AsyncWrite + Unpin,
    {
        let guard = self
            .limiter
            .try_acquire()
            .ok_or_else(|| TunnelError::Capacity(self.limiter.active_count()))?;

        let target = self.ctx.resolve_target(req)?;
        session.resolved(target.addr.clone(), target.cascade);

        let mut conn = self.acquire(&target.addr).await?;

        if let Err(source) = write_handshake(client, &mut conn, target.cascade, req).await {
            conn.close().await;
            return Err(TunnelError::Handshake {
                addr: target.addr,
                source,
            });
        }

        Ok((guard, conn))
    }

    /// Container first, then a fresh dial
    async fn acquire(&self, addr: &str) -> Result<TargetConn, TunnelError> {
        if let Some(container) = &self.conn_container {
            match container.get(addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => debug!("{}, dialing", e),
            }
        }

        let io = self
            .ctx
            .dial(addr)
            .await
            .map_err(|source| TunnelError::Acquisition {
                addr: addr.to_string(),
                source,
            })?;
        Ok(TargetConn::new(addr, io))
    }

    async fn reclaim(&self, target: TargetConn) {
        if target.is_write_closed() {
            debug!("target {} was half-closed by the relay", target.addr());
        }
        match &self.conn_container {
            Some(container) => container.put(target).await,
            None => target.close().await,
        }
    }
}

async fn write_handshake<C>(
    client: &mut C,
    target: &mut TargetConn,
    cascade: bool,
    req: &Request<Bytes>,
) -> io::Result<()>
where
    C: AsyncWrite + Unpin,
{
    if cascade {
        // the next hop resolves the request itself, so it gets it untouched
        target.write_all(&request_bytes(req)).await?;
        target.flush().await
    } else {
        client.write_all(TUNNEL_OK).await?;
        client.flush().await
    }
}

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;

/// Any bidirectional byte stream a tunnel can run over
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection>;

/// Opens fresh connections to `host:port` targets.
///
/// Every dial is bound to a cancellation token; once it is cancelled the dial
/// must fail promptly with [`io::ErrorKind::Interrupted`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> io::Result<BoxedConnection>;
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")),
        res = fut => res,
    }
}

async fn with_connect_timeout<F, T>(limit: Option<Duration>, addr: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", addr, limit),
            ))
        }),
        None => fut.await,
    }
}

/// Plain TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    pub connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Dial and keep the concrete stream type
    pub async fn connect(&self, addr: &str, cancel: &CancellationToken) -> io::Result<TcpStream> {
        let stream = cancellable(
            cancel,
            with_connect_timeout(self.connect_timeout, addr, TcpStream::connect(addr)),
        )
        .await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> io::Result<BoxedConnection> {
        Ok(Box::new(self.connect(addr, cancel).await?))
    }
}

/// SOCKS5 username/password credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dials targets through an upstream SOCKS5 server
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: SocketAddr,
    auth: Option<Auth>,
    connect_timeout: Option<Duration>,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: SocketAddr, auth: Option<Auth>, connect_timeout: Option<Duration>) -> Self {
        Self {
            proxy_addr,
            auth,
            connect_timeout,
        }
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    async fn connect(&self, target_addr: &str) -> io::Result<Socks5Stream<TcpStream>> {
        let stream = match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password(
                    self.proxy_addr,
                    target_addr,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => Socks5Stream::connect(self.proxy_addr, target_addr).await,
        };
        stream.map_err(|e| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("SOCKS5 connect to {} via {} failed: {}", target_addr, self.proxy_addr, e),
            )
        })
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> io::Result<BoxedConnection> {
        let stream = cancellable(
            cancel,
            with_connect_timeout(self.connect_timeout, addr, self.connect(addr)),
        )
        .await?;
        Ok(Box::new(stream))
    }
}

use crate::dial::{BoxedConnection, Dialer};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection to a tunnel target, tagged with the address it was dialed for
pub struct TargetConn {
    addr: String,
    io: BoxedConnection,
    write_closed: bool,
}

impl TargetConn {
    pub fn new(addr: impl Into<String>, io: BoxedConnection) -> Self {
        Self {
            addr: addr.into(),
            io,
            write_closed: false,
        }
    }

    /// Normalized `host:port` this connection belongs to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether our write side was shut down
    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Shut the connection down and drop it
    pub async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!("closing connection to {}: {}", self.addr, e);
        }
    }

    /// Poll the connection once without blocking.
    ///
    /// An idle, healthy connection has nothing to read and can still be
    /// written to. A half-closed write side, EOF, an error or unsolicited
    /// bytes all mean it must not be handed out again.
    fn is_reusable(&mut self) -> bool {
        if self.write_closed {
            return false;
        }
        let mut probe = [0u8; 1];
        self.io.read(&mut probe).now_or_never().is_none()
    }
}

impl std::fmt::Debug for TargetConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConn").field("addr", &self.addr).finish()
    }
}

impl AsyncRead for TargetConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TargetConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write_closed = true;
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no idle connection for {0}")]
    Empty(String),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Keyed store of reusable target connections.
///
/// `get` lends a connection for the address or fails; the caller then dials
/// on its own. `put` hands a connection back and the container decides
/// whether to keep it.
#[async_trait]
pub trait ConnContainer: Send + Sync {
    async fn get(&self, addr: &str) -> Result<TargetConn, PoolError>;
    async fn put(&self, conn: TargetConn);
}

/// Limits for [`IdleConnPool`]
#[derive(Debug, Clone)]
pub struct ConnPoolOptions {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for ConnPoolOptions {
    fn default() -> Self {
        Self {
            max_idle_per_host: 16,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleEntry {
    conn: TargetConn,
    parked_at: Instant,
}

/// Idle connections keyed by target address
pub struct IdleConnPool {
    options: ConnPoolOptions,
    idle: Mutex<HashMap<String, VecDeque<IdleEntry>>>,
}

impl IdleConnPool {
    pub fn new(options: ConnPoolOptions) -> Self {
        Self {
            options,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Number of parked connections for `addr`
    #[cfg(test)]
    pub fn idle_count(&self, addr: &str) -> usize {
        self.lock().get(addr).map(VecDeque::len).unwrap_or(0)
    }

    /// Total number of parked connections
    pub fn total_idle(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<IdleEntry>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_fresh(&self, addr: &str) -> (Option<TargetConn>, Vec<TargetConn>) {
        let mut stale = Vec::new();
        let mut idle = self.lock();
        let Some(queue) = idle.get_mut(addr) else {
            return (None, stale);
        };

        let mut found = None;
        while let Some(mut entry) = queue.pop_back() {
            if entry.parked_at.elapsed() >= self.options.idle_timeout || !entry.conn.is_reusable() {
                stale.push(entry.conn);
                continue;
            }
            found = Some(entry.conn);
            break;
        }
        if queue.is_empty() {
            idle.remove(addr);
        }
        (found, stale)
    }
}

impl Default for IdleConnPool {
    fn default() -> Self {
        Self::new(ConnPoolOptions::default())
    }
}

#[async_trait]
impl ConnContainer for IdleConnPool {
    async fn get(&self, addr: &str) -> Result<TargetConn, PoolError> {
        let (found, stale) = self.take_fresh(addr);
        for conn in stale {
            debug!("discarding stale idle connection to {}", conn.addr());
            conn.close().await;
        }
        found.ok_or_else(|| PoolError::Empty(addr.to_string()))
    }

    async fn put(&self, mut conn: TargetConn) {
        if self.options.max_idle_per_host == 0 || !conn.is_reusable() {
            debug!("not parking connection to {}", conn.addr());
            conn.close().await;
            return;
        }

        let rejected = {
            let mut idle = self.lock();
            let queue = idle.entry(conn.addr().to_string()).or_default();
            if queue.len() >= self.options.max_idle_per_host {
                Some(conn)
            } else {
                queue.push_back(IdleEntry {
                    conn,
                    parked_at: Instant::now(),
                });
                None
            }
        };

        if let Some(conn) = rejected {
            conn.close().await;
        }
    }
}

/// Container that never keeps anything: `get` dials, `put` closes
pub struct DialOnlyContainer {
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
}

impl DialOnlyContainer {
    pub fn new(dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        Self { dialer, cancel }
    }
}

#[async_trait]
impl ConnContainer for DialOnlyContainer {
    async fn get(&self, addr: &str) -> Result<TargetConn, PoolError> {
        match self.dialer.dial(addr, &self.cancel).await {
            Ok(io) => Ok(TargetConn::new(addr, io)),
            Err(source) => Err(PoolError::Dial {
                addr: addr.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, conn: TargetConn) {
        conn.close().await;
    }
}

use crate::buffer_pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Knobs for one relay
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// End the relay when no byte has moved in either direction for this long
    pub idle_timeout: Option<Duration>,
    /// How long client-to-target may keep running after target-to-client ended
    pub drain_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(540)),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Both streams handed back once both directions have ended
#[derive(Debug)]
pub struct Relayed<C, T> {
    pub client: C,
    pub target: T,
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Last activity across both directions
struct IdleClock {
    origin: Instant,
    last_activity_ms: AtomicU64,
    limit: Option<Duration>,
}

impl IdleClock {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            limit,
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn remaining(&self) -> Option<Duration> {
        let limit = self.limit?;
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        let idle = self.origin.elapsed().saturating_sub(last);
        Some(limit.saturating_sub(idle))
    }
}

async fn read_or_idle<R>(reader: &mut R, buf: &mut [u8], clock: &IdleClock) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(remaining) = clock.remaining() else {
            return reader.read(buf).await;
        };
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
        }
        // read is cancel safe: a timed out read has consumed nothing
        if let Ok(res) = tokio::time::timeout(remaining, reader.read(buf)).await {
            if matches!(res, Ok(n) if n > 0) {
                clock.touch();
            }
            return res;
        }
    }
}

/// Copy `reader` into `writer` until EOF, an error or `stop`
async fn copy_direction<R, W>(
    direction: &str,
    reader: &mut R,
    writer: &mut W,
    buf: &mut Vec<u8>,
    clock: &IdleClock,
    stop: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if buf.is_empty() {
        buf.resize(DEFAULT_BUFFER_SIZE, 0);
    }

    let mut copied = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("{} stopped after {} bytes", direction, copied);
                break;
            }
            res = read_or_idle(reader, buf, clock) => res,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("{} write error: {}", direction, e);
                    break;
                }
                copied += n as u64;
            }
            Err(e) => {
                debug!("{} read error: {}", direction, e);
                break;
            }
        }
    }
    if let Err(e) = writer.flush().await {
        debug!("{} flush error: {}", direction, e);
    }
    copied
}

async fn half_close<W: AsyncWrite + Unpin>(direction: &str, writer: &mut W) {
    if let Err(e) = writer.shutdown().await {
        debug!("{} shutdown error: {}", direction, e);
    }
}

/// Relay bytes between `client` and `target` until both directions end.
///
/// Client-to-target runs on its own task, target-to-client on the caller.
/// Each direction borrows one buffer and returns it before it finishes, then
/// half-closes the stream it was writing to. Once target-to-client is done,
/// the other direction gets `drain_timeout` to end on its own before it is
/// stopped. Both streams are handed back whole, so the caller disposes of
/// them only after neither direction can touch them any more.
pub async fn relay<C, T>(
    client: C,
    target: T,
    buffers: Arc<dyn BufferPool>,
    options: &RelayOptions,
) -> io::Result<Relayed<C, T>>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let clock = Arc::new(IdleClock::new(options.idle_timeout));
    let stop = CancellationToken::new();
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut target_r, mut target_w) = tokio::io::split(target);

    let mut upstream = tokio::spawn({
        let buffers = Arc::clone(&buffers);
        let clock = Arc::clone(&clock);
        let stop = stop.clone();
        async move {
            let mut buf = buffers.get();
            let copied =
                copy_direction("client->target", &mut client_r, &mut target_w, &mut buf, &clock, &stop)
                    .await;
            buffers.put(buf);
            half_close("client->target", &mut target_w).await;
            (client_r, target_w, copied)
        }
    });

    let never = CancellationToken::new();
    let mut buf = buffers.get();
    let target_to_client =
        copy_direction("target->client", &mut target_r, &mut client_w, &mut buf, &clock, &never).await;
    buffers.put(buf);
    half_close("target->client", &mut client_w).await;

    let joined = match tokio::time::timeout(options.drain_timeout, &mut upstream).await {
        Ok(joined) => joined,
        Err(_) => {
            stop.cancel();
            upstream.await
        }
    };
    let (client_r, target_w, client_to_target) = joined
        .map_err(|e| io::Error::other(format!("client->target task failed: {}", e)))?;

    Ok(Relayed {
        client: client_r.unsplit(client_w),
        target: target_r.unsplit(target_w),
        client_to_target,
        target_to_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::SizedBufferPool;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Buffer pool that counts loans and returns
    #[derive(Default)]
    struct CountingPool {
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn get(&self) -> Vec<u8> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            vec![0u8; 16]
        }

        fn put(&self, _buffer: Vec<u8>) {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Stream whose reads always fail and whose writes vanish
    struct BrokenStream;

    impl AsyncRead for BrokenStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn echo(mut peer: DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match peer.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if peer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = peer.shutdown().await;
        })
    }

    #[tokio::test]
    async fn echo_round_trip_is_byte_exact() {
        let (client_user, client_proxy) = duplex(64);
        let (target_proxy, target_peer) = duplex(64);
        let echo_task = echo(target_peer);

        let pool: Arc<dyn BufferPool> = Arc::new(SizedBufferPool::new(7, 4));
        let relay_task = tokio::spawn(async move {
            relay(client_proxy, target_proxy, pool, &RelayOptions::default()).await
        });

        // Larger than both the pipes and the copy buffers
        let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(client_user);
            let send = async {
                wr.write_all(&payload).await.unwrap();
                wr.shutdown().await.unwrap();
            };
            let mut echoed = Vec::new();
            let recv = rd.read_to_end(&mut echoed);
            let (_, got) = tokio::join!(send, recv);
            got.unwrap();
            echoed
        });

        assert_eq!(writer.await.unwrap(), expected);
        let relayed = relay_task.await.unwrap().unwrap();
        assert_eq!(relayed.client_to_target, 5_000);
        assert_eq!(relayed.target_to_client, 5_000);
        echo_task.await.unwrap();
    }

    #[tokio::test]
    async fn buffers_are_returned_when_copy_fails() {
        let pool = Arc::new(CountingPool::default());
        let (_client_user, client_proxy) = duplex(64);

        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: Duration::from_millis(20),
        };
        let shared: Arc<dyn BufferPool> = pool.clone();
        // Target dies immediately; the client stays silent and is stopped by the drain timeout
        let relayed = relay(client_proxy, BrokenStream, shared, &options).await.unwrap();

        assert_eq!(relayed.target_to_client, 0);
        assert_eq!(relayed.client_to_target, 0);
        assert_eq!(pool.gets.load(Ordering::SeqCst), 2);
        assert_eq!(pool.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn target_eof_reaches_client() {
        let (mut client_user, client_proxy) = duplex(64);
        let (target_proxy, mut target_peer) = duplex(64);

        let pool: Arc<dyn BufferPool> = Arc::new(SizedBufferPool::default());
        let relay_task =
            tokio::spawn(async move { relay(client_proxy, target_proxy, pool, &RelayOptions::default()).await });

        target_peer.write_all(b"bye").await.unwrap();
        target_peer.shutdown().await.unwrap();

        let mut got = Vec::new();
        client_user.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");

        // Client closes in response, which ends the other direction
        drop(client_user);
        let relayed = relay_task.await.unwrap().unwrap();
        assert_eq!(relayed.target_to_client, 3);
    }

    #[tokio::test]
    async fn idle_relay_times_out() {
        let (_client_user, client_proxy) = duplex(64);
        let (target_proxy, _target_peer) = duplex(64);

        let options = RelayOptions {
            idle_timeout: Some(Duration::from_millis(30)),
            drain_timeout: Duration::from_secs(5),
        };
        let pool: Arc<dyn BufferPool> = Arc::new(SizedBufferPool::default());
        let started = Instant::now();
        let relayed = relay(client_proxy, target_proxy, pool, &options).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(relayed.client_to_target + relayed.target_to_client, 0);
    }

    #[test]
    fn idle_clock_without_limit_never_expires() {
        let clock = IdleClock::new(None);
        assert!(clock.remaining().is_none());

        let clock = IdleClock::new(Some(Duration::from_secs(60)));
        clock.touch();
        assert!(clock.remaining().unwrap() > Duration::from_secs(59));
    }
}

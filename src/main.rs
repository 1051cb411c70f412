mod addr;
mod buffer_pool;
mod config;
mod conn_pool;
mod connection;
mod dial;
mod error;
mod exchange;
mod forward;
mod relay;
mod selector;
mod server;
mod session;
mod traffic;
mod tunnel;

use crate::buffer_pool::{BufferPool, SizedBufferPool};
use crate::config::{Cli, ConnReuse, ProxyConfig};
use crate::conn_pool::{ConnContainer, DialOnlyContainer, IdleConnPool};
use crate::connection::TunnelLimiter;
use crate::dial::{Dialer, Socks5Dialer, TcpDialer};
use crate::forward::ForwardHandler;
use crate::selector::FixedUpstream;
use crate::server::ProxyServer;
use crate::traffic::TrafficCounters;
use crate::tunnel::{TunnelContext, TunnelHandler};
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for active tunnels
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tunnelgate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args).await?;

    info!("HTTP proxy listening on http://{}", config.listen_addr);

    let shutdown = CancellationToken::new();

    let dialer: Arc<dyn Dialer> = match config.socks_dialer {
        Some(proxy_addr) => {
            let socks = Socks5Dialer::new(proxy_addr, config.socks_auth.clone(), config.connect_timeout);
            info!("Dialing targets through SOCKS5 {}", socks.proxy_addr());
            Arc::new(socks)
        }
        None => Arc::new(TcpDialer::new(config.connect_timeout)),
    };

    let mut ctx = TunnelContext::default()
        .with_dialer(Arc::clone(&dialer))
        .with_cancel(shutdown.clone());
    if let Some(upstream) = &config.upstream {
        // userinfo stays out of the log
        info!(
            "Cascading through upstream {}:{}",
            upstream.host().unwrap_or_default(),
            upstream.port_u16().unwrap_or(crate::addr::DEFAULT_PORT)
        );
        let selector = FixedUpstream::new(upstream.clone()).with_bypass(config.cascade_bypass.clone());
        ctx = ctx.with_selector(Arc::new(selector));
    }

    let buffers = Arc::new(SizedBufferPool::new(config.buffer_size, config.buffer_pool_max));
    let idle_pool = match config.conn_reuse {
        ConnReuse::Pool => Some(Arc::new(IdleConnPool::new(config.pool.clone()))),
        _ => None,
    };
    let container: Option<Arc<dyn ConnContainer>> = match config.conn_reuse {
        ConnReuse::Pool => idle_pool.clone().map(|pool| pool as Arc<dyn ConnContainer>),
        ConnReuse::Dial => Some(Arc::new(DialOnlyContainer::new(Arc::clone(&dialer), shutdown.clone()))),
        ConnReuse::Off => None,
    };
    let limiter = Arc::new(TunnelLimiter::new(config.max_tunnels));
    let traffic = Arc::new(TrafficCounters::default());

    let shared_buffers: Arc<dyn BufferPool> = buffers.clone();
    let mut tunnel = TunnelHandler::new(ctx.clone(), shared_buffers)
        .with_relay_options(config.relay.clone())
        .with_limiter(Arc::clone(&limiter))
        .with_traffic(Arc::clone(&traffic));
    if let Some(container) = container {
        tunnel = tunnel.with_conn_container(container);
    }
    let forward = ForwardHandler::new(ctx, config.relay.idle_timeout);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let server = ProxyServer::new(Arc::new(tunnel), Arc::new(forward), shutdown.clone());

    if let Some(interval) = config.stats_interval {
        spawn_stats_monitor(
            interval,
            Arc::clone(&limiter),
            Arc::clone(&traffic),
            buffers,
            idle_pool,
            shutdown.clone(),
        );
    }

    let server_task = tokio::spawn(async move { server.run(listener).await });

    // Graceful shutdown signal handling
    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let active = limiter.active_count();
    if active > 0 {
        info!("Waiting for {} tunnels to close...", active);

        for i in 1..=SHUTDOWN_GRACE_SECS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let remaining = limiter.active_count();

            if remaining == 0 {
                info!("All tunnels closed gracefully");
                break;
            }

            if i % 5 == 0 {
                info!(
                    "Still waiting for {} tunnels... ({}/{}s)",
                    remaining, i, SHUTDOWN_GRACE_SECS
                );
            }
        }

        let final_count = limiter.active_count();
        if final_count > 0 {
            warn!("Forced shutdown with {} tunnels still active", final_count);
        }
    }

    if let Err(e) = server_task.await {
        error!("Server task failed: {}", e);
    }
    info!("Server shutdown complete. {}", traffic.snapshot());

    Ok(())
}

fn spawn_stats_monitor(
    every: Duration,
    limiter: Arc<TunnelLimiter>,
    traffic: Arc<TrafficCounters>,
    buffers: Arc<SizedBufferPool>,
    idle_pool: Option<Arc<IdleConnPool>>,
    shutdown: CancellationToken,
) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;
        let mut last_active = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let active = limiter.active_count();
            if active > 0 || active != last_active {
                info!("Tunnels: {} active, {}", active, traffic.snapshot());
            }

            let pooled = buffers.stats();
            debug!(
                "Buffer pool: {} buffers ({} bytes) of {} bytes each",
                pooled.buffers_available,
                pooled.total_memory_pooled,
                buffers.buffer_size()
            );
            if let Some(pool) = &idle_pool {
                debug!("Idle target connections: {}", pool.total_idle());
            }

            let max = limiter.max();
            if max > 0 && active >= max {
                error!("Tunnel limit reached: {}/{} active", active, max);
            } else if max > 0 && active * 10 >= max * 9 {
                warn!("High tunnel load: {}/{} active", active, max);
            }

            last_active = active;
        }
    });
}

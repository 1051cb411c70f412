use crate::conn_pool::ConnPoolOptions;
use crate::dial::Auth;
use crate::relay::RelayOptions;
use clap::{Args, Parser, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use http::Uri;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How target connections are obtained and disposed of
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConnReuse {
    /// Keep healthy idle connections per target and reuse them
    Pool,
    /// Always dial through the container, never keep anything
    Dial,
    /// No container; dial directly and close after use
    Off,
}

/// SOCKS5 authentication credentials for --socks-dialer
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// Socks5 username
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Socks5 password
    #[arg(short = 'P', long)]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP(S) forward proxy with CONNECT tunneling",
    long_about = "tunnelgate accepts HTTP proxy requests. CONNECT requests become raw byte tunnels to the \
requested target, or are passed verbatim to a cascade upstream proxy. Other requests are forwarded over HTTP/1.\n\n\
Features:\n- Cascade upstream proxy with bypass list (--upstream, --cascade-bypass)\n- Optional SOCKS5 dialer for outbound connections\n- Idle target connection reuse\n- Pooled relay buffers, idle and drain timeouts\n- Tunnel cap and periodic traffic statistics\n"
)]
pub struct Cli {
    /// IP address to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: Ipv4Addr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Cascade every request through this upstream HTTP proxy
    #[arg(long, value_name = "URL")]
    pub upstream: Option<String>,

    /// Hosts that skip the upstream (comma-separated; ".example.com" matches subdomains)
    #[arg(long = "cascade-bypass", value_delimiter = ',')]
    pub cascade_bypass: Vec<String>,

    /// Dial targets through this SOCKS5 server instead of connecting directly
    #[arg(long = "socks-dialer", value_name = "HOST:PORT")]
    pub socks_dialer: Option<String>,

    /// SOCKS5 authentication credentials for the dialer
    #[command(flatten)]
    pub auth: Option<Auths>,

    /// Target connection reuse strategy
    #[arg(long = "conn-reuse", value_enum, default_value_t = ConnReuse::Pool)]
    pub conn_reuse: ConnReuse,

    /// Idle connections kept per target address
    #[arg(long = "pool-max-idle-per-host", default_value_t = 16)]
    pub pool_max_idle_per_host: usize,

    /// Seconds an idle target connection stays reusable
    #[arg(long = "pool-idle-timeout", default_value_t = 90)]
    pub pool_idle_timeout: u64,

    /// Size in bytes of each relay buffer
    #[arg(long = "buffer-size", default_value_t = 32 * 1024)]
    pub buffer_size: usize,

    /// Relay buffers kept for reuse
    #[arg(long = "buffer-pool-max", default_value_t = 100)]
    pub buffer_pool_max: usize,

    /// Connect timeout in seconds for outbound dials (0 disables)
    #[arg(long = "connect-timeout", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Idle timeout in seconds for tunnel connections (0 disables)
    #[arg(long, default_value_t = 540)]
    pub idle_timeout: u64,

    /// Seconds client-to-target may keep flowing after the target side ended
    #[arg(long = "drain-timeout", default_value_t = 5)]
    pub drain_timeout: u64,

    /// Maximum concurrently active tunnels (0 means unlimited)
    #[arg(long = "max-tunnels", default_value_t = crate::connection::MAX_CONCURRENT_TUNNELS)]
    pub max_tunnels: usize,

    /// Interval seconds to log traffic stats (0 disables)
    #[arg(long = "stats-interval", default_value_t = 60)]
    pub stats_interval: u64,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream: Option<Uri>,
    pub cascade_bypass: Vec<String>,
    pub socks_dialer: Option<SocketAddr>,
    pub socks_auth: Option<Auth>,
    pub conn_reuse: ConnReuse,
    pub pool: ConnPoolOptions,
    pub buffer_size: usize,
    pub buffer_pool_max: usize,
    pub connect_timeout: Option<Duration>,
    pub relay: RelayOptions,
    pub max_tunnels: usize,
    pub stats_interval: Option<Duration>,
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub async fn from_cli(args: Cli) -> Result<Self> {
        let listen_addr = SocketAddr::from((args.listen_ip, args.port));

        let upstream = args.upstream.as_deref().map(parse_upstream).transpose()?;

        let socks_dialer = match args.socks_dialer.as_deref() {
            Some(address) => match tokio::net::lookup_host(address).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => Some(addr),
                    None => return Err(eyre!("No addresses found for {}", address)),
                },
                Err(e) => return Err(eyre!("Failed to resolve {}: {}", address, e)),
            },
            None => None,
        };

        let socks_auth = match args.auth.as_ref().map(|a| (&a.username, &a.password)) {
            None | Some((None, None)) => None,
            Some((Some(u), Some(p))) => Some(Auth::new(u.clone(), p.clone())),
            Some(_) => return Err(eyre!("SOCKS5 auth needs both --username and --password")),
        };
        if socks_auth.is_some() && socks_dialer.is_none() {
            return Err(eyre!("--username/--password only apply together with --socks-dialer"));
        }

        if args.buffer_size == 0 {
            return Err(eyre!("--buffer-size must be greater than zero"));
        }

        Ok(Self {
            listen_addr,
            upstream,
            cascade_bypass: args.cascade_bypass,
            socks_dialer,
            socks_auth,
            conn_reuse: args.conn_reuse,
            pool: ConnPoolOptions {
                max_idle_per_host: args.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(args.pool_idle_timeout),
            },
            buffer_size: args.buffer_size,
            buffer_pool_max: args.buffer_pool_max,
            connect_timeout: non_zero_secs(args.connect_timeout),
            relay: RelayOptions {
                idle_timeout: non_zero_secs(args.idle_timeout),
                drain_timeout: Duration::from_secs(args.drain_timeout),
            },
            max_tunnels: args.max_tunnels,
            stats_interval: non_zero_secs(args.stats_interval),
        })
    }
}

/// Upstream proxy URL. `https` upstreams are reached over plain TCP like `http`.
fn parse_upstream(raw: &str) -> Result<Uri> {
    let uri: Uri = raw
        .parse()
        .map_err(|e| eyre!("Invalid --upstream {:?}: {}", raw, e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(eyre!("Unsupported upstream scheme {:?}", other)),
        None => return Err(eyre!("--upstream needs a scheme, e.g. http://{}", raw)),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(eyre!("--upstream {:?} names no host", raw));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tunnelgate").chain(args.iter().copied())).unwrap()
    }

    #[tokio::test]
    async fn defaults() {
        let config = ProxyConfig::from_cli(parse(&[])).await.unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert!(config.upstream.is_none());
        assert_eq!(config.conn_reuse, ConnReuse::Pool);
        assert_eq!(config.pool.max_idle_per_host, 16);
        assert_eq!(config.buffer_size, 32 * 1024);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.relay.idle_timeout, Some(Duration::from_secs(540)));
        assert_eq!(config.max_tunnels, 40000);
    }

    #[tokio::test]
    async fn zero_disables_timeouts() {
        let config = ProxyConfig::from_cli(parse(&[
            "--idle-timeout",
            "0",
            "--connect-timeout",
            "0",
            "--stats-interval",
            "0",
        ]))
        .await
        .unwrap();
        assert!(config.relay.idle_timeout.is_none());
        assert!(config.connect_timeout.is_none());
        assert!(config.stats_interval.is_none());
    }

    #[tokio::test]
    async fn upstream_and_socks_dialer() {
        let config = ProxyConfig::from_cli(parse(&[
            "--upstream",
            "http://user:pw@proxy.local:3128",
            "--cascade-bypass",
            "localhost,.corp.example",
            "--socks-dialer",
            "127.0.0.1:1080",
            "-u",
            "alice",
            "-P",
            "secret",
            "--conn-reuse",
            "off",
        ]))
        .await
        .unwrap();
        assert_eq!(config.upstream.unwrap().host(), Some("proxy.local"));
        assert_eq!(config.cascade_bypass, vec!["localhost", ".corp.example"]);
        assert_eq!(config.socks_dialer, Some("127.0.0.1:1080".parse().unwrap()));
        assert_eq!(config.socks_auth.unwrap().username, "alice");
        assert_eq!(config.conn_reuse, ConnReuse::Off);
    }

    #[tokio::test]
    async fn rejects_bad_settings() {
        assert!(ProxyConfig::from_cli(parse(&["--upstream", "proxy.local:3128"])).await.is_err());
        assert!(ProxyConfig::from_cli(parse(&["--upstream", "socks5://proxy.local:1080"])).await.is_err());
        assert!(ProxyConfig::from_cli(parse(&["-u", "alice", "-P", "pw"])).await.is_err());
        assert!(ProxyConfig::from_cli(parse(&["--socks-dialer", "127.0.0.1:1080", "-u", "alice"]))
            .await
            .is_err());
        assert!(ProxyConfig::from_cli(parse(&["--buffer-size", "0"])).await.is_err());
    }
}

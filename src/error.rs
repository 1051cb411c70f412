use crate::exchange::HijackError;
use crate::selector::SelectError;

/// Ways a tunnel session can fail
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The client socket could not be taken over; the session never started
    #[error("hijack failed: {0}")]
    Hijack(#[from] HijackError),

    #[error("tunnel limit reached: {0} active")]
    Capacity(usize),

    /// The proxy selector failed, or no target could be derived
    #[error("target resolution failed: {0}")]
    Resolution(#[source] SelectError),

    /// Neither the connection container nor a fresh dial produced a connection
    #[error("connect to {addr} failed: {source}")]
    Acquisition {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The relay task itself died (panic or abort), not a peer disconnect
    #[error("relay aborted: {0}")]
    Relay(#[source] std::io::Error),
}

impl TunnelError {
    /// Whether the client gets the bare `502` tunnel failure line for this error
    pub fn is_tunnel_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::Capacity(_)
                | TunnelError::Resolution(_)
                | TunnelError::Acquisition { .. }
                | TunnelError::Handshake { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn failures_before_target_use_tunnel_failure_signal() {
        assert!(TunnelError::Capacity(3).is_tunnel_failure());
        assert!(TunnelError::Resolution("no route".into()).is_tunnel_failure());
        assert!(TunnelError::Acquisition {
            addr: "a:80".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
        .is_tunnel_failure());
        assert!(TunnelError::Handshake {
            addr: "a:80".to_string(),
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        }
        .is_tunnel_failure());

        assert!(!TunnelError::Hijack(HijackError::AlreadyHijacked).is_tunnel_failure());
        assert!(!TunnelError::Relay(io::Error::other("panicked")).is_tunnel_failure());
    }

    #[test]
    fn acquisition_message_names_target() {
        let err = TunnelError::Acquisition {
            addr: "example.com:443".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.to_string(), "connect to example.com:443 failed: refused");
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Global session counter for generating unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID
///
/// The session ID is composed of:
/// - Current timestamp (lower 48 bits of nanoseconds since UNIX epoch)
/// - Monotonic counter (lower 32 bits)
///
/// Compact lowercase hex, unique even under heavy concurrency.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// One CONNECT tunnel from request entry to teardown
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub id: String,
    pub peer: Option<SocketAddr>,
    target_addr: Option<String>,
    is_cascade: bool,
    started: Instant,
}

impl TunnelSession {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: new_session_id(),
            peer,
            target_addr: None,
            is_cascade: false,
            started: Instant::now(),
        }
    }

    /// Record where the tunnel goes. Only the first resolution sticks.
    pub fn resolved(&mut self, target_addr: String, is_cascade: bool) {
        if self.target_addr.is_none() {
            self.target_addr = Some(target_addr);
            self.is_cascade = is_cascade;
        }
    }

    pub fn target_addr(&self) -> Option<&str> {
        self.target_addr.as_deref()
    }

    pub fn is_cascade(&self) -> bool {
        self.is_cascade
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_session_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = new_session_id();
            assert!(!ids.contains(&id), "Duplicate session ID generated: {}", id);
            ids.insert(id);
        }
    }

    #[test]
    fn new_session_id_format() {
        let id = new_session_id();
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.len() >= 2 && id.len() <= 32);
    }

    #[test]
    fn resolution_is_set_once() {
        let mut session = TunnelSession::new(None);
        assert!(session.target_addr().is_none());

        session.resolved("proxy.local:3128".to_string(), true);
        session.resolved("example.com:443".to_string(), false);

        assert_eq!(session.target_addr(), Some("proxy.local:3128"));
        assert!(session.is_cascade());
        assert!(session.age() < Duration::from_secs(1));
    }
}

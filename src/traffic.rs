use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters shared by every tunnel of one listener
#[derive(Debug, Default)]
pub struct TrafficCounters {
    client_to_target: AtomicU64,
    target_to_client: AtomicU64,
    tunnels_completed: AtomicU64,
}

impl TrafficCounters {
    /// Account for one finished tunnel
    pub fn record_tunnel(&self, client_to_target: u64, target_to_client: u64) {
        self.client_to_target.fetch_add(client_to_target, Ordering::Relaxed);
        self.target_to_client.fetch_add(target_to_client, Ordering::Relaxed);
        self.tunnels_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            client_to_target: self.client_to_target.load(Ordering::Relaxed),
            target_to_client: self.target_to_client.load(Ordering::Relaxed),
            tunnels_completed: self.tunnels_completed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub fn reset(&self) {
        self.client_to_target.store(0, Ordering::Relaxed);
        self.target_to_client.store(0, Ordering::Relaxed);
        self.tunnels_completed.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub tunnels_completed: u64,
}

impl std::fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tunnels, {}↑ {}↓ bytes",
            self.tunnels_completed, self.client_to_target, self.target_to_client
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_resets() {
        let counters = TrafficCounters::default();
        counters.record_tunnel(10, 200);
        counters.record_tunnel(5, 0);

        assert_eq!(
            counters.snapshot(),
            TrafficSnapshot {
                client_to_target: 15,
                target_to_client: 200,
                tunnels_completed: 2,
            }
        );
        assert_eq!(counters.snapshot().to_string(), "2 tunnels, 15↑ 200↓ bytes");

        counters.reset();
        assert_eq!(counters.snapshot(), TrafficSnapshot::default());
    }
}

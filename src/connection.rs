use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default cap on concurrently active tunnels
pub const MAX_CONCURRENT_TUNNELS: usize = 40000;

/// Counts active tunnels and enforces an optional cap
#[derive(Debug)]
pub struct TunnelLimiter {
    active: AtomicUsize,
    max: usize,
}

impl TunnelLimiter {
    /// `max == 0` means no cap
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserve a slot, or `None` when the cap is reached
    pub fn try_acquire(self: &Arc<Self>) -> Option<TunnelGuard> {
        let mut current = self.active.load(Ordering::Relaxed);

        loop {
            if self.max != 0 && current >= self.max {
                return None;
            }

            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(TunnelGuard {
                        limiter: Arc::clone(self),
                        released: false,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// RAII guard to ensure the active tunnel count is properly decremented
#[derive(Debug)]
pub struct TunnelGuard {
    limiter: Arc<TunnelLimiter>,
    released: bool,
}

impl TunnelGuard {
    /// Give the slot back; later calls are no-ops
    fn release(&mut self) {
        if !self.released {
            self.limiter.active.fetch_sub(1, Ordering::Relaxed);
            self.released = true;
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

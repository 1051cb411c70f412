use std::sync::Mutex;

/// Default size of a relay copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle buffers kept around
pub const DEFAULT_MAX_POOLED: usize = 100;

/// Lends and reclaims copy buffers for the relay.
///
/// Implementations must be safe to share between sessions. A buffer handed
/// out by `get` has a non-zero length; the relay reads into the whole slice.
pub trait BufferPool: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buffer: Vec<u8>);
}

/// Free list of fixed-size buffers backed by a mutex
pub struct SizedBufferPool {
    buffer_size: usize,
    max_pooled: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl SizedBufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes, keeping at
    /// most `max_pooled` idle buffers
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            buffer_size,
            max_pooled,
            buffers: Mutex::new(Vec::with_capacity(max_pooled.min(DEFAULT_MAX_POOLED))),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get statistics about the buffer pool
    pub fn stats(&self) -> BufferPoolStats {
        let available = self.lock().len();
        BufferPoolStats {
            buffers_available: available,
            total_memory_pooled: available * self.buffer_size,
        }
    }

    /// Drop every idle buffer
    #[cfg(test)]
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        // A panic while holding the lock cannot leave the free list inconsistent
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SizedBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_POOLED)
    }
}

impl BufferPool for SizedBufferPool {
    fn get(&self) -> Vec<u8> {
        let size = self.buffer_size;
        match self.lock().pop() {
            Some(mut buffer) => {
                debug_assert!(buffer.capacity() >= size);
                buffer.resize(size, 0);
                buffer
            }
            None => vec![0u8; size],
        }
    }

    fn put(&self, mut buffer: Vec<u8>) {
        let expected = self.buffer_size;

        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < expected || buffer.capacity() > expected * 2 {
            return;
        }

        // Zero on return so no tunnel sees another tunnel's bytes
        buffer.clear();
        buffer.resize(expected, 0);

        let mut pool = self.lock();
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }
}

/// Statistics about the buffer pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub buffers_available: usize,
    pub total_memory_pooled: usize,
}

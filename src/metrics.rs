// src/metrics.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Process-wide accounting of bytes held by client slot buffers.
static CLIENT_MEMORY: Lazy<Arc<AtomicI64>> = Lazy::new(|| Arc::new(AtomicI64::new(0)));

pub fn client_memory() -> Arc<AtomicI64> {
    CLIENT_MEMORY.clone()
}

pub fn client_memory_bytes() -> i64 {
    CLIENT_MEMORY.load(Ordering::Relaxed)
}

/// Per-worker counters; the runner sums them for its periodic report.
pub struct WorkerMetrics {
    pub req_count: AtomicU64,
    pub active_conns: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, received: u64, sent: u64) {
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the counters of one transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub rdma_reads: u64,
    pub rdma_writes: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Submissions that had to wait for credit.
    pub quota_stalls: u64,
    /// Credits returned by send completions.
    pub credits_returned: u64,
    /// Queue drain attempts triggered by returned credit.
    pub churns: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
    pub rdma_reads: AtomicU64,
    pub rdma_writes: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub quota_stalls: AtomicU64,
    pub credits_returned: AtomicU64,
    pub churns: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransportStats {
            msgs_sent: get(&self.msgs_sent),
            msgs_received: get(&self.msgs_received),
            rdma_reads: get(&self.rdma_reads),
            rdma_writes: get(&self.rdma_writes),
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
            quota_stalls: get(&self.quota_stalls),
            credits_returned: get(&self.credits_returned),
            churns: get(&self.churns),
        }
    }
}

/// Post counts of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Posts in use.
    pub active: usize,
    /// Posts ready for reuse.
    pub passive: usize,
}

/// Snapshot of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub name: String,
    pub send_posts: PoolStats,
    pub recv_posts: PoolStats,
    /// Peers registered by QP number.
    pub peers: usize,
    pub fresh_registrations: u64,
    pub arena_hits: u64,
}

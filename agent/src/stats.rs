use std::sync::atomic::{AtomicUsize, Ordering};

// Counters shared by all the workers of one session. These are atomic
// because every worker bumps them from its own thread.
#[derive(Debug, Default)]
pub struct Stats {
    pub device_rx: AtomicUsize,
    pub device_tx: AtomicUsize,
    pub dropped: AtomicUsize,
    pub tcp_flows: AtomicUsize,
    pub udp_flows: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub device_rx: usize,
    pub device_tx: usize,
    pub dropped: usize,
    pub tcp_flows: usize,
    pub udp_flows: usize,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            device_rx: self.device_rx.load(Ordering::Relaxed),
            device_tx: self.device_tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tcp_flows: self.tcp_flows.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set(counter: &AtomicUsize, val: usize) {
        counter.store(val, Ordering::Relaxed);
    }
}

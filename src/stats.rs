//! Statistics tracking for the portal proxy.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::DropReason;

/// Atomic counters for proxy traffic.
pub struct Stats {
    pub received: AtomicU64,
    /// Upstream responses matched to waiting clients.
    pub relayed: AtomicU64,
    /// Client sends issued for relayed responses.
    pub fanned_out: AtomicU64,
    pub forwarded: AtomicU64,
    pub redirected: AtomicU64,
    pub dropped: AtomicU64,
    /// Responses nobody was waiting for. Also counted in `dropped`.
    pub unsolicited: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            fanned_out: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            redirected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unsolicited: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, endpoints: usize) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.fanned_out
            .fetch_add(endpoints as u64, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redirected(&self) {
        self.redirected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if reason == DropReason::Unsolicited {
            self.unsolicited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.swap(0, Ordering::Relaxed),
            relayed: self.relayed.swap(0, Ordering::Relaxed),
            fanned_out: self.fanned_out.swap(0, Ordering::Relaxed),
            forwarded: self.forwarded.swap(0, Ordering::Relaxed),
            redirected: self.redirected.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            unsolicited: self.unsolicited.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub received: u64,
    pub relayed: u64,
    pub fanned_out: u64,
    pub forwarded: u64,
    pub redirected: u64,
    pub dropped: u64,
    pub unsolicited: u64,
}

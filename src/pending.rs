//! Pending-query table.
//!
//! Tracks which clients are waiting on an upstream answer, keyed by DNS
//! transaction ID. Several clients may wait on the same ID; the first upstream
//! response carrying that ID is delivered to all of them and clears the entry.

use rustc_hash::FxHashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Correlation key for an outstanding query: its transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(pub u16);

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CorrelationKey {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

struct Waiter {
    addr: SocketAddr,
    registered_at: Instant,
}

/// Concurrency-safe map from correlation key to the clients awaiting it.
///
/// Lookups take a shared lock; `register`, `drain` and `sweep_expired` take
/// the exclusive lock. By default entries never expire. A table built with
/// [`PendingTable::with_ttl`] drops registrations older than the TTL whenever
/// [`PendingTable::sweep_expired`] runs.
pub struct PendingTable {
    entries: RwLock<FxHashMap<CorrelationKey, Vec<Waiter>>>,
    ttl: Option<Duration>,
}

impl PendingTable {
    /// Unbounded table; an upstream that never answers leaves its entry behind.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl: None,
        }
    }

    /// Table whose registrations may be swept once older than `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl: Some(ttl),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Add `addr` to the waiters for `key`. Duplicates are kept.
    pub fn register(&self, key: CorrelationKey, addr: SocketAddr) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key).or_default().push(Waiter {
            addr,
            registered_at: Instant::now(),
        });
    }

    /// Remove and return every waiter for `key`, in registration order.
    ///
    /// `None` means nothing was waiting: a late, duplicate or unsolicited answer.
    pub fn drain(&self, key: CorrelationKey) -> Option<Vec<SocketAddr>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let waiters = entries.remove(&key)?;
        Some(waiters.into_iter().map(|w| w.addr).collect())
    }

    /// Number of clients waiting on `key`.
    pub fn waiting(&self, key: CorrelationKey) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&key).map_or(0, Vec::len)
    }

    /// Number of distinct keys outstanding.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop registrations older than the TTL. Returns how many were removed.
    ///
    /// No-op on a table without a TTL.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        entries.retain(|_, waiters| {
            let before = waiters.len();
            waiters.retain(|w| now.duration_since(w.registered_at) < ttl);
            removed += before - waiters.len();
            !waiters.is_empty()
        });
        removed
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Portal proxy orchestration.
//!
//! Binds the listening socket, wires up the engine and runs it together
//! with its background housekeeping.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::engine::{Engine, EngineConfig};
use crate::error::{ProxyError, Result};
use crate::pending::PendingTable;
use crate::policy::Authorizer;
use crate::stats::Stats;

/// Configuration for the portal proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// Resolver for authorized clients
    pub upstream: SocketAddr,
    /// Address handed to unauthorized clients for every name
    pub portal: Ipv4Addr,
    /// Forget outstanding queries after this long. `None` keeps them forever.
    pub pending_ttl: Option<Duration>,
    /// How often to log traffic counters
    pub stats_interval: Duration,
}

/// Run the proxy with the given configuration.
///
/// Returns only on a fatal error: failing to bind, or the listening socket
/// becoming unreadable.
pub async fn run(config: ProxyConfig, authorizer: Arc<dyn Authorizer>) -> Result<()> {
    let socket = UdpSocket::bind(config.bind_addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: config.bind_addr,
            source,
        })?;

    let pending = Arc::new(match config.pending_ttl {
        Some(ttl) => PendingTable::with_ttl(ttl),
        None => PendingTable::new(),
    });
    let stats = Arc::new(Stats::new());

    info!(
        bind = %config.bind_addr,
        upstream = %config.upstream,
        portal = %config.portal,
        pending_ttl = ?config.pending_ttl,
        "portal DNS proxy listening"
    );

    let mut housekeeping = vec![spawn_stats_reporter(
        stats.clone(),
        pending.clone(),
        config.stats_interval.max(Duration::from_secs(1)),
    )];
    if let Some(ttl) = config.pending_ttl.filter(|ttl| !ttl.is_zero()) {
        housekeeping.push(spawn_pending_sweeper(pending.clone(), ttl));
    }

    let engine = Engine::new(
        Arc::new(socket),
        EngineConfig {
            upstream: config.upstream,
            portal: config.portal,
        },
        pending,
        authorizer,
        stats,
    );
    let result = engine.run().await;

    for task in housekeeping {
        task.abort();
    }
    result
}

/// Log traffic counters every `period`.
fn spawn_stats_reporter(
    stats: Arc<Stats>,
    pending: Arc<PendingTable>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let s = stats.snapshot_and_reset();
            info!(
                received = s.received,
                forwarded = s.forwarded,
                redirected = s.redirected,
                relayed = s.relayed,
                fanned_out = s.fanned_out,
                dropped = s.dropped,
                unsolicited = s.unsolicited,
                pending = pending.len(),
                "[stats]"
            );
        }
    })
}

/// Expire stale registrations. Only runs when a TTL is configured.
fn spawn_pending_sweeper(pending: Arc<PendingTable>, ttl: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = pending.sweep_expired();
            if removed > 0 {
                debug!(removed, remaining = pending.len(), "expired pending queries");
            }
        }
    })
}

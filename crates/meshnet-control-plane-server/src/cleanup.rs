//! Periodic sweep task for the Control Plane Server (spec.md §4.9
//! "Cleanup runs periodically: peers stale > 5 min are deleted; empty
//! parties are deleted; expired tokens are deleted; relays stale > 2 min
//! are deleted"), modeled as the same kind of long-running, explicitly
//! owned background loop as `LocalBackend`'s `cleanup_loop` (spec.md §9
//! "Coroutine-like background loops").

use crate::db;
use sqlx::SqlitePool;
use std::time::Duration;

/// Cadence of the sweep. Distinct from the 5 min / 2 min staleness
/// thresholds themselves.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Peers idle longer than this are deleted (spec.md §4.9).
pub const PEER_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Relays idle longer than this are deleted (spec.md §4.10 gives the
/// forwarder's own 5 min window; §4.9's registry uses the shorter 2 min
/// the server table description calls for).
pub const RELAY_STALE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Runs [`db::cleanup`] once, logging the resulting counts.
pub async fn run_once(pool: &SqlitePool) {
    match db::cleanup(pool, PEER_STALE_TIMEOUT, RELAY_STALE_TIMEOUT).await {
        Ok(report) => {
            if report.stale_peers > 0
                || report.empty_parties > 0
                || report.expired_tokens > 0
                || report.stale_relays > 0
            {
                tracing::info!(
                    stale_peers = report.stale_peers,
                    empty_parties = report.empty_parties,
                    expired_tokens = report.expired_tokens,
                    stale_relays = report.stale_relays,
                    "control plane cleanup sweep"
                );
            }
        }
        Err(error) => {
            tracing::warn!(%error, "control plane cleanup sweep failed");
        }
    }
}

/// Spawns the 60 s cleanup loop; intended to be tied to the server
/// binary's lifetime and joined on shutdown (spec.md §9).
pub fn spawn(pool: SqlitePool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            run_once(&pool).await;
        }
    })
}

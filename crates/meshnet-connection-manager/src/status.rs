use meshnet_model::Strategy;
use meshnet_peer_conn::PeerState;
use std::time::Duration;

/// Snapshot returned by [`crate::ConnectionManager::status`] (spec.md §4.6
/// `status(peer_id) -> { state, strategy, endpoint, latency? }`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerStatus {
    pub state: PeerState,
    pub strategy: Strategy,
    pub latency: Option<Duration>,
}

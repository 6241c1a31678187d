//! Control Plane (spec.md §4.8): the uniform party/peer registry contract,
//! with an in-process local backend and an HTTP remote backend.

mod local;
mod remote;

pub use local::{LocalBackend, LocalBackendConfig};
pub use remote::{RemoteBackend, RemoteBackendConfig};

use async_trait::async_trait;
use meshnet_model::{MeshError, Party, Peer, PeerId, PartyId, RelayRecord};

/// Uniform operations across backends (spec.md §4.8).
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register_party(
        &self,
        party_id: PartyId,
        name: String,
        host_peer: Peer,
    ) -> Result<Party, MeshError>;

    async fn join_party(&self, party_id: PartyId, peer: Peer) -> Result<Party, MeshError>;

    async fn leave_party(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError>;

    /// Refreshes `last_seen`; idempotent.
    async fn update_peer(&self, party_id: PartyId, peer: Peer) -> Result<(), MeshError>;

    async fn get_peers(&self, party_id: PartyId) -> Result<Vec<Peer>, MeshError>;

    async fn discover_peer(&self, party_id: PartyId, peer_id: PeerId) -> Result<Peer, MeshError>;

    async fn heartbeat(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError>;

    /// Remote backend only; the local backend has no relay registry of its
    /// own and returns an empty list.
    async fn list_relays(&self) -> Result<Vec<RelayRecord>, MeshError>;
}

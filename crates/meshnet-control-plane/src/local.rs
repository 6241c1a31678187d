//! Local backend: purely in-process state, snapshotted to disk via the
//! State Persister, with an optional shared discovery file for same-LAN
//! peer discovery without any server at all.

use crate::ControlPlane;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use meshnet_model::{MeshError, Party, Peer, PeerId, PartyId, RelayRecord};
use meshnet_state_persister::StatePersister;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Peers idle longer than this are reaped by the cleanup task
/// (spec.md §4.8 "stale timeout: 5 minutes").
const STALE_TIMEOUT: chrono::Duration = chrono::Duration::minutes(5);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Default)]
pub struct LocalBackendConfig {
    /// Path for the State Persister's JSON snapshot; `None` disables
    /// persistence (useful for tests and ephemeral hosts).
    pub snapshot_path: Option<PathBuf>,
    /// Path to a file shared by same-LAN peers for discovery without a
    /// remote control plane server.
    pub discovery_file: Option<PathBuf>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct Snapshot {
    parties: BTreeMap<PartyId, Party>,
}

pub struct LocalBackend {
    parties: DashMap<PartyId, Arc<AsyncMutex<Party>>>,
    persister: Option<StatePersister>,
    discovery_file: Option<PathBuf>,
}

impl LocalBackend {
    /// Loads any existing snapshot, spawns the State Persister (if
    /// configured) and the 60 s cleanup task, and returns the backend.
    pub fn spawn(config: LocalBackendConfig) -> Arc<Self> {
        let parties = DashMap::new();

        if let Some(path) = &config.snapshot_path {
            if let Some(snapshot) = meshnet_state_persister::load_snapshot::<Snapshot>(path) {
                for (party_id, party) in snapshot.parties {
                    parties.insert(party_id, Arc::new(AsyncMutex::new(party)));
                }
            }
        }

        let persister = config.snapshot_path.map(StatePersister::spawn);

        let backend = Arc::new(Self {
            parties,
            persister,
            discovery_file: config.discovery_file,
        });

        tokio::spawn(cleanup_loop(backend.clone()));

        backend
    }

    fn queue_snapshot(&self) {
        let Some(persister) = &self.persister else {
            return;
        };
        let parties: BTreeMap<PartyId, Party> = self
            .parties
            .iter()
            .map(|entry| (*entry.key(), entry.value().try_lock().map(|p| p.clone())))
            .filter_map(|(id, party)| party.ok().map(|p| (id, p)))
            .collect();
        persister.queue_snapshot(&Snapshot { parties });
    }

    fn write_discovery_file(&self, party: &Party) {
        let Some(path) = &self.discovery_file else {
            return;
        };
        match serde_json::to_vec_pretty(party) {
            Ok(bytes) => {
                if let Err(error) = std::fs::write(path, bytes) {
                    tracing::warn!(%error, path = %path.display(), "failed to write discovery file");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to serialize discovery file"),
        }
    }

    async fn party_lock(&self, party_id: PartyId) -> Result<Arc<AsyncMutex<Party>>, MeshError> {
        self.parties
            .get(&party_id)
            .map(|entry| entry.clone())
            .ok_or(MeshError::PartyNotFound(party_id))
    }
}

async fn cleanup_loop(backend: Arc<LocalBackend>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        backend.run_cleanup().await;
    }
}

impl LocalBackend {
    async fn run_cleanup(&self) {
        let now = Utc::now();
        let mut emptied = Vec::new();

        for entry in self.parties.iter() {
            let mut party = entry.value().lock().await;
            party
                .peers
                .retain(|_, peer| now.signed_duration_since(peer.last_seen) < STALE_TIMEOUT);
            if party.is_empty() {
                emptied.push(*entry.key());
            }
        }

        for party_id in emptied {
            self.parties.remove(&party_id);
        }

        self.queue_snapshot();
    }
}

#[async_trait]
impl ControlPlane for LocalBackend {
    async fn register_party(
        &self,
        party_id: PartyId,
        name: String,
        host_peer: Peer,
    ) -> Result<Party, MeshError> {
        if self.parties.contains_key(&party_id) {
            return Err(MeshError::Conflict(format!(
                "party {party_id} already exists"
            )));
        }

        let party = Party::new(party_id, name, host_peer);
        self.write_discovery_file(&party);
        self.parties
            .insert(party_id, Arc::new(AsyncMutex::new(party.clone())));
        self.queue_snapshot();
        Ok(party)
    }

    async fn join_party(&self, party_id: PartyId, peer: Peer) -> Result<Party, MeshError> {
        let lock = self.party_lock(party_id).await?;
        let mut party = lock.lock().await;

        if party.peers.contains_key(&peer.peer_id) {
            return Err(MeshError::Conflict(format!(
                "peer {} already in party {party_id}",
                peer.peer_id
            )));
        }

        party.peers.insert(peer.peer_id, peer);
        let snapshot = party.clone();
        drop(party);

        self.write_discovery_file(&snapshot);
        self.queue_snapshot();
        Ok(snapshot)
    }

    async fn leave_party(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError> {
        let lock = self.party_lock(party_id).await?;
        let mut party = lock.lock().await;
        party
            .peers
            .remove(&peer_id)
            .ok_or(MeshError::PeerNotFound(peer_id))?;
        let is_empty = party.is_empty();
        drop(party);

        if is_empty {
            self.parties.remove(&party_id);
        }
        self.queue_snapshot();
        Ok(())
    }

    async fn update_peer(&self, party_id: PartyId, peer: Peer) -> Result<(), MeshError> {
        let lock = self.party_lock(party_id).await?;
        let mut party = lock.lock().await;
        party.peers.insert(peer.peer_id, peer);
        let snapshot = party.clone();
        drop(party);

        self.write_discovery_file(&snapshot);
        self.queue_snapshot();
        Ok(())
    }

    async fn get_peers(&self, party_id: PartyId) -> Result<Vec<Peer>, MeshError> {
        let lock = self.party_lock(party_id).await?;
        let party = lock.lock().await;
        Ok(party.peers.values().cloned().collect())
    }

    async fn discover_peer(&self, party_id: PartyId, peer_id: PeerId) -> Result<Peer, MeshError> {
        let lock = self.party_lock(party_id).await?;
        let party = lock.lock().await;
        party
            .peers
            .get(&peer_id)
            .cloned()
            .ok_or(MeshError::PeerNotFound(peer_id))
    }

    async fn heartbeat(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError> {
        let lock = self.party_lock(party_id).await?;
        let mut party = lock.lock().await;
        let peer = party
            .peers
            .get_mut(&peer_id)
            .ok_or(MeshError::PeerNotFound(peer_id))?;
        peer.last_seen = Utc::now();
        Ok(())
    }

    async fn list_relays(&self) -> Result<Vec<RelayRecord>, MeshError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_model::{Endpoint, NatClass, TunnelPublicKey};
    use std::net::Ipv4Addr;

    fn peer(party_id: PartyId) -> Peer {
        Peer {
            peer_id: PeerId::random(),
            name: "alice".into(),
            public_key: TunnelPublicKey::from_bytes([1u8; 32]),
            nat_class: NatClass::Open,
            reflexive_endpoint: Some(Endpoint::new(Ipv4Addr::LOCALHOST.into(), 1)),
            declared_local_endpoint: None,
            last_seen: Utc::now(),
            party_id,
        }
    }

    #[tokio::test]
    async fn register_then_join_then_get_peers() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let party_id = PartyId::generate();
        let host = peer(party_id);
        let host_id = host.peer_id;

        backend
            .register_party(party_id, "squad".into(), host)
            .await
            .unwrap();

        let joiner = peer(party_id);
        let joiner_id = joiner.peer_id;
        backend.join_party(party_id, joiner).await.unwrap();

        let peers = backend.get_peers(party_id).await.unwrap();
        let ids: std::collections::HashSet<_> = peers.iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, std::collections::HashSet::from([host_id, joiner_id]));
    }

    #[tokio::test]
    async fn registering_duplicate_party_id_conflicts() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let party_id = PartyId::generate();
        backend
            .register_party(party_id, "squad".into(), peer(party_id))
            .await
            .unwrap();

        let result = backend
            .register_party(party_id, "squad".into(), peer(party_id))
            .await;
        assert!(matches!(result, Err(MeshError::Conflict(_))));
    }

    #[tokio::test]
    async fn leave_removes_peer_and_empties_party() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let party_id = PartyId::generate();
        let host = peer(party_id);
        let host_id = host.peer_id;
        backend
            .register_party(party_id, "squad".into(), host)
            .await
            .unwrap();

        backend.leave_party(party_id, host_id).await.unwrap();

        let result = backend.get_peers(party_id).await;
        assert!(matches!(result, Err(MeshError::PartyNotFound(_))));
    }

    #[tokio::test]
    async fn unknown_party_operations_error() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let result = backend.get_peers(PartyId::generate()).await;
        assert!(matches!(result, Err(MeshError::PartyNotFound(_))));
    }

    #[tokio::test]
    async fn heartbeat_refreshes_last_seen() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let party_id = PartyId::generate();
        let mut host = peer(party_id);
        host.last_seen = Utc::now() - chrono::Duration::minutes(10);
        let host_id = host.peer_id;
        backend
            .register_party(party_id, "squad".into(), host)
            .await
            .unwrap();

        backend.heartbeat(party_id, host_id).await.unwrap();

        let refreshed = backend.discover_peer(party_id, host_id).await.unwrap();
        assert!(Utc::now().signed_duration_since(refreshed.last_seen) < chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn cleanup_reaps_stale_peers_and_empty_parties() {
        let backend = LocalBackend::spawn(LocalBackendConfig::default());
        let party_id = PartyId::generate();
        let mut host = peer(party_id);
        host.last_seen = Utc::now() - chrono::Duration::minutes(10);
        let host_id = host.peer_id;
        backend
            .register_party(party_id, "squad".into(), host)
            .await
            .unwrap();

        backend.run_cleanup().await;

        let result = backend.discover_peer(party_id, host_id).await;
        assert!(matches!(result, Err(MeshError::PartyNotFound(_))));
    }
}

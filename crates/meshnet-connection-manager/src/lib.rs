//! Connection Manager (spec.md §4.6): orchestrates the set of
//! [`PeerConnectionSm`]s for a process, owning virtual-address allocation
//! and the Tunnel Device.
//!
//! Grounded in `connlib-tunnel`'s `peer_store` + the `ClientState`/
//! `GatewayState` event loop: a central map keyed by peer identity, with
//! per-peer work driven by a long-running task rather than a back-pointer
//! into the owning struct (spec.md §9 "Cyclic references between Manager
//! and Peer Connection SM"). Each peer task reports its terminal outcome
//! back over an `mpsc` channel instead of reaching back into the Manager
//! directly, the same way `connlib-tunnel`'s workers report through
//! `Sent`/events rather than holding a reference to the `Tunnel`.

mod config;
mod status;
mod task;

pub use config::ConnectionManagerConfig;
pub use status::PeerStatus;

use dashmap::DashMap;
use meshnet_addr_pool::AddressPool;
use meshnet_control_plane::ControlPlane;
use meshnet_model::{MeshError, NatClass, PartyId, PeerId};
use meshnet_relay_selector::RelayProber;
use meshnet_tun::TunnelDevice;
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

pub(crate) enum ManagerEvent {
    Cleaned(PeerId),
}

struct PeerHandle {
    status: Arc<RwLock<PeerStatus>>,
    disconnect: Arc<Notify>,
    _task: JoinHandle<()>,
}

/// Orchestrates peer connections: the only component allowed to mutate the
/// [`TunnelDevice`] (spec.md §3 "Ownership").
pub struct ConnectionManager {
    control_plane: Arc<dyn ControlPlane>,
    tun: Arc<dyn TunnelDevice>,
    addr_pool: Arc<AddressPool>,
    relay_prober: Arc<dyn RelayProber>,
    config: ConnectionManagerConfig,
    coordination_socket: Arc<UdpSocket>,
    local_nat_class: RwLock<NatClass>,
    connections: DashMap<PeerId, PeerHandle>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ConnectionManager {
    /// Binds the coordination socket (used for both NAT probing and hole
    /// punching, per spec.md §4.1 "the same local UDP port that will be
    /// used by the tunnel device") and spawns the reaper task that retires
    /// completed peer connections.
    pub async fn spawn(
        control_plane: Arc<dyn ControlPlane>,
        tun: Arc<dyn TunnelDevice>,
        addr_pool: Arc<AddressPool>,
        relay_prober: Arc<dyn RelayProber>,
        config: ConnectionManagerConfig,
    ) -> std::io::Result<Arc<Self>> {
        let coordination_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            control_plane,
            tun,
            addr_pool,
            relay_prober,
            config,
            coordination_socket: Arc::new(coordination_socket),
            local_nat_class: RwLock::new(NatClass::Unknown),
            connections: DashMap::new(),
            events_tx,
        });

        tokio::spawn(reap_loop(manager.clone(), events_rx));

        Ok(manager)
    }

    /// Runs the NAT Prober against the coordination socket and caches the
    /// result for subsequent [`Self::connect`] calls (spec.md §2 "Coordinator
    /// consults NAT Prober for local NAT class").
    pub async fn refresh_local_nat_class(
        &self,
        prober_config: &meshnet_nat_prober::NatProberConfig,
    ) -> Result<NatClass, MeshError> {
        let result = meshnet_nat_prober::detect(&self.coordination_socket, prober_config)
            .await
            .map_err(|error| MeshError::NetworkUnreachable(error.to_string()))?;
        *self.local_nat_class.write() = result.nat_class;
        Ok(result.nat_class)
    }

    pub fn set_local_nat_class(&self, class: NatClass) {
        *self.local_nat_class.write() = class;
    }

    /// Connects to `peer_id` within `party_id` (spec.md §4.6). Any failure
    /// leaves no side effects: an allocated address is released and a
    /// programmed tunnel entry is removed before the error is returned.
    pub async fn connect(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError> {
        if self.connections.contains_key(&peer_id) {
            return Ok(()); // already connecting/connected; idempotent.
        }

        let peer = self.control_plane.discover_peer(party_id, peer_id).await?;

        let peer_reflexive = peer.reflexive_endpoint.ok_or_else(|| {
            MeshError::NetworkUnreachable(format!("peer {peer_id} has no reflexive endpoint yet"))
        })?;

        let relay_candidates = self.relay_candidates().await;
        let local_nat_class = *self.local_nat_class.read();

        let strategy = meshnet_coordinator::coordinate(
            &self.coordination_socket,
            local_nat_class,
            peer.nat_class,
            peer_reflexive,
            &relay_candidates,
            self.relay_prober.as_ref(),
        )
        .await
        .map_err(|_| MeshError::NoRelayAvailable)?;

        let address = self
            .addr_pool
            .allocate(peer_id)
            .map_err(|_| MeshError::AddressPoolExhausted)?;

        let peer_config = meshnet_tun::PeerConfig {
            public_key: peer.public_key,
            endpoint: strategy.endpoint(),
            allowed_address: address.into(),
        };

        if let Err(error) = self.tun.upsert_peer(peer_config).await {
            self.addr_pool.release(peer_id);
            return Err(MeshError::TunnelDeviceError(error.to_string()));
        }

        let status = Arc::new(RwLock::new(PeerStatus {
            state: meshnet_peer_conn::PeerState::Connecting,
            strategy,
            latency: None,
        }));
        let disconnect = Arc::new(Notify::new());

        let ctx = task::PeerTaskCtx {
            peer_id,
            public_key: peer.public_key,
            allowed_address: address.into(),
            tun: self.tun.clone(),
            relay_prober: self.relay_prober.clone(),
            control_plane: self.control_plane.clone(),
            config: self.config.clone(),
            status: status.clone(),
            disconnect: disconnect.clone(),
            events_tx: self.events_tx.clone(),
        };

        let task_handle = tokio::spawn(task::run(ctx, strategy));

        self.connections.insert(
            peer_id,
            PeerHandle {
                status,
                disconnect,
                _task: task_handle,
            },
        );

        Ok(())
    }

    /// Idempotent: signals the peer's task to enter `cleanup`. No-op if the
    /// peer is already gone.
    pub fn disconnect(&self, peer_id: PeerId) {
        if let Some(handle) = self.connections.get(&peer_id) {
            handle.disconnect.notify_one();
        }
    }

    pub fn status(&self, peer_id: PeerId) -> Option<PeerStatus> {
        self.connections
            .get(&peer_id)
            .map(|handle| handle.status.read().clone())
    }

    async fn relay_candidates(&self) -> Vec<meshnet_model::Endpoint> {
        let control_plane_relays = self
            .control_plane
            .list_relays()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|relay| relay.public_endpoint);

        meshnet_relay_selector::build_candidate_list(
            control_plane_relays,
            self.config.static_relay_endpoint,
            self.config.builtin_default_relay,
        )
    }
}

async fn reap_loop(manager: Arc<ConnectionManager>, mut events_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            ManagerEvent::Cleaned(peer_id) => {
                manager.addr_pool.release(peer_id);
                manager.connections.remove(&peer_id);
                tracing::debug!(%peer_id, "peer connection retired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_control_plane::{LocalBackend, LocalBackendConfig};
    use meshnet_model::{Endpoint, Peer, TunnelPublicKey};
    use meshnet_tun::InMemoryTunnelDevice;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct AlwaysReachableProber;
    #[async_trait::async_trait]
    impl RelayProber for AlwaysReachableProber {
        async fn probe_rtt(&self, _endpoint: meshnet_model::Endpoint) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }
    }

    fn peer_with(party_id: PartyId, nat_class: NatClass, reflexive: Endpoint) -> Peer {
        Peer {
            peer_id: PeerId::random(),
            name: "peer".into(),
            public_key: TunnelPublicKey::from_bytes([3u8; 32]),
            nat_class,
            reflexive_endpoint: Some(reflexive),
            declared_local_endpoint: None,
            last_seen: chrono::Utc::now(),
            party_id,
        }
    }

    #[tokio::test]
    async fn connect_allocates_address_and_programs_tunnel() {
        let control_plane: Arc<dyn ControlPlane> = LocalBackend::spawn(LocalBackendConfig::default());
        let tun = Arc::new(InMemoryTunnelDevice::new());
        let addr_pool = Arc::new(AddressPool::new(Default::default()));
        let relay_prober: Arc<dyn RelayProber> = Arc::new(AlwaysReachableProber);

        let party_id = PartyId::generate();
        let open_reflexive = Endpoint::new(Ipv4Addr::LOCALHOST.into(), 4000);
        let host = peer_with(party_id, NatClass::Open, open_reflexive);
        let peer = peer_with(party_id, NatClass::Open, open_reflexive);
        let peer_id = peer.peer_id;
        let peer_key = peer.public_key;

        control_plane
            .register_party(party_id, "party".into(), host)
            .await
            .unwrap();
        control_plane.join_party(party_id, peer).await.unwrap();

        let manager = ConnectionManager::spawn(
            control_plane,
            tun.clone(),
            addr_pool,
            relay_prober,
            ConnectionManagerConfig::default(),
        )
        .await
        .unwrap();
        manager.set_local_nat_class(NatClass::Open);

        manager.connect(party_id, peer_id).await.unwrap();

        assert!(tun.peer(&peer_key).is_some());
        let status = manager.status(peer_id).unwrap();
        assert_eq!(status.strategy.endpoint(), open_reflexive);
    }

    #[tokio::test]
    async fn connect_unknown_peer_fails_with_peer_not_found() {
        let control_plane: Arc<dyn ControlPlane> = LocalBackend::spawn(LocalBackendConfig::default());
        let tun = Arc::new(InMemoryTunnelDevice::new());
        let addr_pool = Arc::new(AddressPool::new(Default::default()));
        let relay_prober: Arc<dyn RelayProber> = Arc::new(AlwaysReachableProber);

        let manager = ConnectionManager::spawn(
            control_plane,
            tun,
            addr_pool,
            relay_prober,
            ConnectionManagerConfig::default(),
        )
        .await
        .unwrap();

        let result = manager.connect(PartyId::generate(), PeerId::random()).await;
        assert!(matches!(result, Err(MeshError::PartyNotFound(_))));
    }

    #[tokio::test]
    async fn disconnect_releases_address_and_removes_tunnel_entry() {
        let control_plane: Arc<dyn ControlPlane> = LocalBackend::spawn(LocalBackendConfig::default());
        let tun = Arc::new(InMemoryTunnelDevice::new());
        let addr_pool = Arc::new(AddressPool::new(Default::default()));
        let relay_prober: Arc<dyn RelayProber> = Arc::new(AlwaysReachableProber);

        let party_id = PartyId::generate();
        let open_reflexive = Endpoint::new(Ipv4Addr::LOCALHOST.into(), 4001);
        let host = peer_with(party_id, NatClass::Open, open_reflexive);
        let peer = peer_with(party_id, NatClass::Open, open_reflexive);
        let peer_id = peer.peer_id;
        let peer_key = peer.public_key;

        control_plane
            .register_party(party_id, "party".into(), host)
            .await
            .unwrap();
        control_plane.join_party(party_id, peer).await.unwrap();

        let manager = ConnectionManager::spawn(
            control_plane,
            tun.clone(),
            addr_pool.clone(),
            relay_prober,
            ConnectionManagerConfig::default(),
        )
        .await
        .unwrap();
        manager.set_local_nat_class(NatClass::Open);
        manager.connect(party_id, peer_id).await.unwrap();

        manager.disconnect(peer_id);

        // The per-peer task performs cleanup asynchronously; poll briefly.
        for _ in 0..50 {
            if tun.peer(&peer_key).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(tun.peer(&peer_key).is_none());
        assert!(addr_pool.allocate(PeerId::random()).is_ok());
    }
}

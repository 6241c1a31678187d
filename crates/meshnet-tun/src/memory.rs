use crate::{PeerConfig, TunnelDevice, TunnelDeviceError};
use async_trait::async_trait;
use meshnet_model::TunnelPublicKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// An in-memory [`TunnelDevice`] used by tests across the workspace (and
/// usable as a degenerate real implementation in environments with no
/// platform tunnel available, e.g. CI).
///
/// Latency is simulated: callers can preset a fixed reply (or "no reply")
/// per peer via [`InMemoryTunnelDevice::set_latency`].
#[derive(Default)]
pub struct InMemoryTunnelDevice {
    peers: RwLock<HashMap<TunnelPublicKey, PeerConfig>>,
    latencies: RwLock<HashMap<TunnelPublicKey, Option<Duration>>>,
}

impl InMemoryTunnelDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, key: TunnelPublicKey, latency: Option<Duration>) {
        self.latencies.write().insert(key, latency);
    }

    pub fn peer(&self, key: &TunnelPublicKey) -> Option<PeerConfig> {
        self.peers.read().get(key).copied()
    }
}

#[async_trait]
impl TunnelDevice for InMemoryTunnelDevice {
    async fn upsert_peer(&self, config: PeerConfig) -> Result<(), TunnelDeviceError> {
        self.peers.write().insert(config.public_key, config);
        Ok(())
    }

    async fn remove_peer(&self, public_key: TunnelPublicKey) -> Result<(), TunnelDeviceError> {
        self.peers.write().remove(&public_key);
        self.latencies.write().remove(&public_key);
        Ok(())
    }

    async fn update_endpoint(
        &self,
        public_key: TunnelPublicKey,
        endpoint: meshnet_model::Endpoint,
    ) -> Result<(), TunnelDeviceError> {
        let mut peers = self.peers.write();
        let entry = peers
            .get_mut(&public_key)
            .ok_or(TunnelDeviceError::NoSuchPeer(public_key))?;
        entry.endpoint = endpoint;
        Ok(())
    }

    async fn probe_latency(
        &self,
        public_key: TunnelPublicKey,
    ) -> Result<Option<Duration>, TunnelDeviceError> {
        if !self.peers.read().contains_key(&public_key) {
            return Err(TunnelDeviceError::NoSuchPeer(public_key));
        }
        Ok(self
            .latencies
            .read()
            .get(&public_key)
            .copied()
            .unwrap_or(Some(Duration::from_millis(10))))
    }

    fn allowed_addresses(&self) -> Vec<IpAddr> {
        self.peers.read().values().map(|p| p.allowed_address).collect()
    }
}

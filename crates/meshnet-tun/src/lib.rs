//! The Tunnel Device Adapter (spec.md §2, §4.6, §4.9 "Tunnel Device").
//!
//! This is an explicit external collaborator: spec.md §1 scopes
//! platform-specific VPN device provisioning out of the hard core. What
//! stays in scope is the *narrow interface* the core consumes, modeled
//! here the way the teacher's `tun::Tun` trait models "abstract create /
//! configure / teardown of a device" — a small trait plus an in-memory
//! test double, with the real platform implementation left unimplemented.

mod memory;

pub use memory::InMemoryTunnelDevice;

use async_trait::async_trait;
use meshnet_model::{Endpoint, TunnelPublicKey};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TunnelDeviceError {
    #[error("device refused to configure peer {0}: {1}")]
    ConfigurationRefused(TunnelPublicKey, String),
    #[error("no such peer: {0}")]
    NoSuchPeer(TunnelPublicKey),
    #[error("latency probe to {0} timed out")]
    ProbeTimeout(TunnelPublicKey),
}

/// A peer entry as programmed on the tunnel device: the spec.md §3
/// invariant "only one strategy/endpoint is active on the tunnel device
/// for a given TunnelPublicKey at any instant" is enforced by callers
/// always going through `upsert_peer` (never by composing add+remove).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerConfig {
    pub public_key: TunnelPublicKey,
    pub endpoint: Endpoint,
    pub allowed_address: IpAddr,
}

/// Abstract encrypted UDP tunnel keyed by X25519 public keys.
///
/// Implementations own the actual WireGuard-style device (a kernel
/// interface, a userspace `boringtun`-style device, or — in tests — an
/// in-memory stand-in). The Connection Manager is the only caller allowed
/// to mutate it (spec.md §3 "Ownership"); the Broadcast Emulator only ever
/// reads peer virtual addresses through [`TunnelDevice::allowed_addresses`].
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Programs (or reprograms) a single peer entry. Replaces any existing
    /// entry for `config.public_key` atomically from the caller's point of
    /// view.
    async fn upsert_peer(&self, config: PeerConfig) -> Result<(), TunnelDeviceError>;

    /// Removes a peer entry. Idempotent: removing an absent peer is not an
    /// error (spec.md §4.6 "disconnect ... is idempotent").
    async fn remove_peer(&self, public_key: TunnelPublicKey) -> Result<(), TunnelDeviceError>;

    /// Re-points an already-configured peer at a new endpoint without
    /// touching its allowed address, used when a relay switch or NAT
    /// rebind happens (spec.md §4.5 reconnect policy).
    async fn update_endpoint(
        &self,
        public_key: TunnelPublicKey,
        endpoint: Endpoint,
    ) -> Result<(), TunnelDeviceError>;

    /// Measures round-trip latency to a configured peer. A `None` result
    /// means the probe did not get a reply within the device's own
    /// timeout budget (spec.md §4.5 "a probe without a reply ... counts as
    /// a failure sample").
    async fn probe_latency(
        &self,
        public_key: TunnelPublicKey,
    ) -> Result<Option<Duration>, TunnelDeviceError>;

    /// Virtual addresses currently programmed, for the Broadcast Emulator's
    /// read-only view (spec.md §3 "Ownership").
    fn allowed_addresses(&self) -> Vec<IpAddr>;
}

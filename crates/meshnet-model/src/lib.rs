//! Shared data model and error taxonomy for the LANrage mesh.
//!
//! This crate contains the types every other crate in the workspace agrees
//! on: peer/party identifiers, the tunnel's cryptographic identity, NAT
//! classification, endpoints, and the error kinds described in spec.md §7.
//! It intentionally has almost no behavior — just the closed product types
//! spec.md §9 asks for in place of dynamically-typed attribute objects.

#[macro_use]
mod make_id;
mod endpoint;
mod error;
mod nat_class;
mod party_id;
mod tunnel_key;

pub use endpoint::Endpoint;
pub use error::MeshError;
pub use nat_class::NatClass;
pub use party_id::{InvalidPartyId, PartyId};
pub use tunnel_key::{TunnelKeyError, TunnelPublicKey};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

make_id!(PeerId);
make_id!(RelayRecordId);

/// Control-plane view of a single participant (spec.md §3 "Peer").
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub peer_id: PeerId,
    pub name: String,
    pub public_key: TunnelPublicKey,
    pub nat_class: NatClass,
    pub reflexive_endpoint: Option<Endpoint>,
    pub declared_local_endpoint: Option<Endpoint>,
    pub last_seen: DateTime<Utc>,
    pub party_id: PartyId,
}

/// Control-plane view of a party (spec.md §3 "Party").
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Party {
    pub party_id: PartyId,
    pub name: String,
    pub host_peer_id: PeerId,
    pub created_at: DateTime<Utc>,
    /// PeerId -> Peer. A `BTreeMap` keeps insertion-independent logic honest
    /// (iteration order is never load-bearing) while still being stable
    /// enough for deterministic snapshot serialization.
    pub peers: BTreeMap<PeerId, Peer>,
}

impl Party {
    pub fn new(party_id: PartyId, name: String, host: Peer) -> Self {
        let host_peer_id = host.peer_id;
        let mut peers = BTreeMap::new();
        peers.insert(host_peer_id, host);
        Self {
            party_id,
            name,
            host_peer_id,
            created_at: Utc::now(),
            peers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Central relay registry entry (spec.md §3 "RelayRecord").
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RelayRecord {
    pub relay_id: String,
    pub public_endpoint: Endpoint,
    pub region: String,
    pub capacity: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Either a direct or relayed strategy, the tagged variant spec.md §9 calls
/// for in place of ad hoc strategy strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    Direct(Endpoint),
    Relay(Endpoint),
}

impl Strategy {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Strategy::Direct(e) | Strategy::Relay(e) => *e,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Strategy::Direct(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Direct(_) => "direct",
            Strategy::Relay(_) => "relay",
        }
    }
}

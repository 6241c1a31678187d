//! Route handlers for the Control Plane Server's HTTP surface (spec.md
//! §6.1). Wire shapes mirror `meshnet_control_plane::remote`'s client-side
//! `PeerInfo`/`PartyInfo` DTOs field for field, since the two crates speak
//! the same wire contract without sharing types.

use crate::auth::AuthenticatedPeer;
use crate::db;
use crate::{ApiError, AppState};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use meshnet_model::{Endpoint, NatClass, PartyId, Peer, PeerId, RelayRecord};
use std::net::IpAddr;

#[derive(serde::Serialize, serde::Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
    pub nat_type: NatClass,
    pub public_ip: IpAddr,
    pub public_port: u16,
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    fn from_peer(peer: &Peer) -> Self {
        let reflexive = peer
            .reflexive_endpoint
            .unwrap_or(Endpoint::new(IpAddr::from([0, 0, 0, 0]), 0));
        let local = peer.declared_local_endpoint;
        Self {
            peer_id: peer.peer_id.to_string(),
            name: peer.name.clone(),
            public_key: peer.public_key.to_string(),
            nat_type: peer.nat_class,
            public_ip: reflexive.ip,
            public_port: reflexive.port,
            local_ip: local.map(|e| e.ip),
            local_port: local.map(|e| e.port),
            last_seen: peer.last_seen,
        }
    }

    fn into_peer(self, party_id: PartyId) -> Result<Peer, ApiError> {
        Ok(Peer {
            peer_id: self.peer_id.parse().map_err(|_| ApiError::NotFound)?,
            name: self.name,
            public_key: self.public_key.parse().map_err(|_| ApiError::NotFound)?,
            nat_class: self.nat_type,
            reflexive_endpoint: Some(Endpoint::new(self.public_ip, self.public_port)),
            declared_local_endpoint: self
                .local_ip
                .zip(self.local_port)
                .map(|(ip, port)| Endpoint::new(ip, port)),
            last_seen: self.last_seen,
            party_id,
        })
    }
}

#[derive(serde::Serialize)]
pub struct PartyInfo {
    pub party_id: String,
    pub name: String,
    pub host_peer_id: String,
    pub peers: Vec<PeerInfo>,
}

async fn load_party_info(state: &AppState, party_id: PartyId) -> Result<PartyInfo, ApiError> {
    let party = db::get_party(&state.pool, party_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let peers = db::list_peers(&state.pool, party_id).await?;

    Ok(PartyInfo {
        party_id: party.party_id.to_string(),
        name: party.name,
        host_peer_id: party.host_peer_id.to_string(),
        peers: peers.iter().map(PeerInfo::from_peer).collect(),
    })
}

#[derive(serde::Deserialize)]
pub struct RegisterQuery {
    peer_id: String,
}

#[derive(serde::Serialize)]
pub struct RegisterResponse {
    token: String,
    peer_id: String,
    expires_at: DateTime<Utc>,
}

pub async fn register(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let peer_id: PeerId = query.peer_id.parse().map_err(|_| ApiError::NotFound)?;
    let token = crate::auth::generate_token();
    let expires_at = db::insert_token(&state.pool, &token, peer_id, *state.token_ttl).await?;

    Ok(Json(RegisterResponse {
        token,
        peer_id: peer_id.to_string(),
        expires_at,
    }))
}

#[derive(serde::Deserialize)]
pub struct CreatePartyRequest {
    name: String,
    host_peer_info: PeerInfo,
}

#[derive(serde::Serialize)]
pub struct PartyResponse {
    party_id: String,
    party: PartyInfo,
}

pub async fn create_party(
    State(state): State<AppState>,
    _auth: AuthenticatedPeer,
    Json(body): Json<CreatePartyRequest>,
) -> Result<Json<PartyResponse>, ApiError> {
    let party_id = PartyId::generate();
    let host = body.host_peer_info.into_peer(party_id)?;

    let created = db::create_party(&state.pool, party_id, &body.name, &host).await?;
    if !created {
        return Err(ApiError::Conflict(format!(
            "party {party_id} or peer {} already exists",
            host.peer_id
        )));
    }
    let party = load_party_info(&state, party_id).await?;

    Ok(Json(PartyResponse {
        party_id: party_id.to_string(),
        party,
    }))
}

#[derive(serde::Deserialize)]
pub struct JoinPartyRequest {
    peer_info: PeerInfo,
}

#[derive(serde::Serialize)]
pub struct JoinPartyResponse {
    party: PartyInfo,
}

pub async fn join_party(
    State(state): State<AppState>,
    Path(party_id): Path<String>,
    _auth: AuthenticatedPeer,
    Json(body): Json<JoinPartyRequest>,
) -> Result<Json<JoinPartyResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    db::get_party(&state.pool, party_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let peer = body.peer_info.into_peer(party_id)?;
    let joined = db::join_party(&state.pool, &peer).await?;
    if !joined {
        return Err(ApiError::Conflict(format!("peer {} already registered", peer.peer_id)));
    }

    let party = load_party_info(&state, party_id).await?;
    Ok(Json(JoinPartyResponse { party }))
}

#[derive(serde::Serialize)]
pub struct StatusResponse {
    status: &'static str,
}

fn ok_status() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub async fn delete_peer(
    State(state): State<AppState>,
    Path((party_id, peer_id)): Path<(String, String)>,
    auth: AuthenticatedPeer,
) -> Result<Json<StatusResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    let peer_id: PeerId = peer_id.parse().map_err(|_| ApiError::NotFound)?;
    auth.require_matches(peer_id)?;

    let existed = db::delete_peer(&state.pool, party_id, peer_id).await?;
    if !existed {
        return Err(ApiError::NotFound);
    }
    Ok(ok_status())
}

pub async fn get_party(
    State(state): State<AppState>,
    Path(party_id): Path<String>,
    _auth: AuthenticatedPeer,
) -> Result<Json<JoinPartyResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    let party = load_party_info(&state, party_id).await?;
    Ok(Json(JoinPartyResponse { party }))
}

#[derive(serde::Serialize)]
pub struct ListPeersResponse {
    peers: Vec<PeerInfo>,
}

pub async fn list_peers(
    State(state): State<AppState>,
    Path(party_id): Path<String>,
    _auth: AuthenticatedPeer,
) -> Result<Json<ListPeersResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    db::get_party(&state.pool, party_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let peers = db::list_peers(&state.pool, party_id).await?;
    Ok(Json(ListPeersResponse {
        peers: peers.iter().map(PeerInfo::from_peer).collect(),
    }))
}

#[derive(serde::Serialize)]
pub struct GetPeerResponse {
    peer: PeerInfo,
}

pub async fn get_peer(
    State(state): State<AppState>,
    Path((party_id, peer_id)): Path<(String, String)>,
    auth: AuthenticatedPeer,
) -> Result<Json<GetPeerResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    let peer_id: PeerId = peer_id.parse().map_err(|_| ApiError::NotFound)?;
    auth.require_matches(peer_id)?;

    let peer = db::get_peer(&state.pool, party_id, peer_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(GetPeerResponse {
        peer: PeerInfo::from_peer(&peer),
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path((party_id, peer_id)): Path<(String, String)>,
    auth: AuthenticatedPeer,
) -> Result<Json<StatusResponse>, ApiError> {
    let party_id: PartyId = party_id.parse().map_err(|_| ApiError::NotFound)?;
    let peer_id: PeerId = peer_id.parse().map_err(|_| ApiError::NotFound)?;
    auth.require_matches(peer_id)?;

    let updated = db::heartbeat_peer(&state.pool, party_id, peer_id).await?;
    if !updated {
        return Err(ApiError::NotFound);
    }
    Ok(ok_status())
}

#[derive(serde::Deserialize)]
pub struct RegisterRelayRequest {
    relay_id: String,
    public_ip: IpAddr,
    port: u16,
    region: String,
    capacity: u32,
}

pub async fn register_relay(
    State(state): State<AppState>,
    _auth: AuthenticatedPeer,
    Json(body): Json<RegisterRelayRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let record = RelayRecord {
        relay_id: body.relay_id,
        public_endpoint: Endpoint::new(body.public_ip, body.port),
        region: body.region,
        capacity: body.capacity,
        registered_at: Utc::now(),
        last_heartbeat: Utc::now(),
    };
    db::upsert_relay(&state.pool, &record).await?;
    Ok(ok_status())
}

#[derive(serde::Serialize)]
pub struct ListRelaysResponse {
    relays: Vec<RelayRecord>,
}

pub async fn list_relays(
    State(state): State<AppState>,
    _auth: AuthenticatedPeer,
) -> Result<Json<ListRelaysResponse>, ApiError> {
    let relays = db::list_relays(&state.pool).await?;
    Ok(Json(ListRelaysResponse { relays }))
}

#[derive(serde::Serialize)]
pub struct HealthResponse {
    parties: i64,
    peers: i64,
    relays: i64,
}

pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let counts = db::health_counts(&state.pool).await?;
    Ok(Json(HealthResponse {
        parties: counts.parties,
        peers: counts.peers,
        relays: counts.relays,
    }))
}

//! Remote backend: an HTTP client for the Control Plane Server
//! (spec.md §4.8, §6.1), grounded in `phoenix-channel`'s use of
//! `backoff::ExponentialBackoff` for reconnect/retry pacing — simplified
//! from its persistent-websocket state machine to plain request/response
//! HTTP since spec.md's control-plane surface is a REST API, not a
//! channel protocol.

use crate::ControlPlane;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use meshnet_model::{Endpoint, MeshError, NatClass, Party, Peer, PeerId, PartyId, RelayRecord};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Clone)]
pub struct RemoteBackendConfig {
    pub base_url: String,
    pub token: String,
    /// Per-request timeout (spec.md §5 "Control-plane HTTP: 10 s per
    /// request").
    pub request_timeout: Duration,
    /// Backoff parameters for `Transient` errors (spec.md §7: start
    /// 250 ms, cap 30 s).
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            token: String::new(),
            request_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Degrades to serving cached reads rather than crashing on catastrophic
/// connectivity loss (spec.md §4.8).
struct Cache {
    parties: std::collections::HashMap<PartyId, Party>,
    degraded: bool,
}

pub struct RemoteBackend {
    client: reqwest::Client,
    config: RemoteBackendConfig,
    cache: RwLock<Cache>,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig) -> Result<Self, MeshError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| MeshError::NetworkUnreachable(error.to_string()))?;

        Ok(Self {
            client,
            config,
            cache: RwLock::new(Cache {
                parties: std::collections::HashMap::new(),
                degraded: false,
            }),
        })
    }

    /// Runs every 30 s while the caller holds the backend alive
    /// (spec.md §5 "Remote control plane heartbeat: 30 s cadence").
    pub async fn heartbeat_loop(&self, party_id: PartyId, peer_id: PeerId) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        let mut consecutive_misses = 0u32;
        loop {
            ticker.tick().await;
            match self.heartbeat(party_id, peer_id).await {
                Ok(()) => consecutive_misses = 0,
                Err(error) => {
                    consecutive_misses += 1;
                    tracing::warn!(%error, consecutive_misses, "control plane heartbeat failed");
                    if consecutive_misses >= 3 {
                        self.cache.write().degraded = true;
                    }
                }
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.cache.read().degraded
    }

    async fn request_with_retry<T, F, Fut>(&self, operation: F) -> Result<T, MeshError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, MeshError>>,
    {
        let backoff = ExponentialBackoff {
            initial_interval: self.config.backoff_initial,
            max_interval: self.config.backoff_max,
            max_elapsed_time: Some(Duration::from_secs(120)),
            randomization_factor: 0.2,
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(backoff, || async {
            match operation().await {
                Ok(value) => Ok(value),
                Err(error) if error.is_retryable() => {
                    Err(backoff::Error::transient(error))
                }
                Err(error) => Err(backoff::Error::permanent(error)),
            }
        })
        .await
        .map_err(|error| match error {
            backoff::Error::Permanent(e) | backoff::Error::Transient { err: e, .. } => e,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MeshError> {
        let response = request
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() || error.is_connect() {
                    MeshError::Transient(error.to_string())
                } else {
                    MeshError::NetworkUnreachable(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_to_error(status, &response.text().await.unwrap_or_default()));
        }

        response
            .json()
            .await
            .map_err(|error| MeshError::NetworkUnreachable(error.to_string()))
    }
}

fn status_to_error(status: reqwest::StatusCode, body: &str) -> MeshError {
    use reqwest::StatusCode;
    match status {
        StatusCode::UNAUTHORIZED => MeshError::Unauthorized,
        StatusCode::FORBIDDEN => MeshError::Forbidden,
        StatusCode::NOT_FOUND => MeshError::PeerNotFound(PeerId::random()),
        StatusCode::CONFLICT => MeshError::Conflict(body.to_string()),
        s if s.is_server_error() => MeshError::Transient(format!("server error {s}")),
        s => MeshError::NetworkUnreachable(format!("unexpected status {s}: {body}")),
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PeerInfo {
    peer_id: String,
    name: String,
    public_key: String,
    nat_type: NatClass,
    public_ip: IpAddr,
    public_port: u16,
    local_ip: Option<IpAddr>,
    local_port: Option<u16>,
    last_seen: DateTime<Utc>,
}

impl PeerInfo {
    fn from_peer(peer: &Peer) -> Self {
        let reflexive = peer.reflexive_endpoint.unwrap_or(Endpoint::new(
            IpAddr::from([0, 0, 0, 0]),
            0,
        ));
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

    fn into_peer(self, party_id: PartyId) -> Result<Peer, MeshError> {
        let peer_id = self
            .peer_id
            .parse()
            .map_err(|_| MeshError::NetworkUnreachable("malformed peer_id from server".into()))?;
        let public_key = self
            .public_key
            .parse()
            .map_err(|_| MeshError::NetworkUnreachable("malformed public_key from server".into()))?;
        Ok(Peer {
            peer_id,
            name: self.name,
            public_key,
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

#[derive(serde::Deserialize)]
struct PartyInfo {
    party_id: String,
    name: String,
    host_peer_id: String,
    peers: Vec<PeerInfo>,
}

impl PartyInfo {
    fn into_party(self) -> Result<Party, MeshError> {
        let party_id: PartyId = self
            .party_id
            .parse()
            .map_err(|_| MeshError::NetworkUnreachable("malformed party_id from server".into()))?;
        let host_peer_id: PeerId = self
            .host_peer_id
            .parse()
            .map_err(|_| MeshError::NetworkUnreachable("malformed host_peer_id from server".into()))?;
        let mut peers = std::collections::BTreeMap::new();
        for peer in self.peers {
            let peer = peer.into_peer(party_id)?;
            peers.insert(peer.peer_id, peer);
        }
        Ok(Party {
            party_id,
            name: self.name,
            host_peer_id,
            created_at: Utc::now(),
            peers,
        })
    }
}

#[async_trait]
impl ControlPlane for RemoteBackend {
    async fn register_party(
        &self,
        _party_id: PartyId,
        name: String,
        host_peer: Peer,
    ) -> Result<Party, MeshError> {
        #[derive(serde::Serialize)]
        struct Body {
            name: String,
            host_peer_info: PeerInfo,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            party: PartyInfo,
        }

        let body = Body {
            name,
            host_peer_info: PeerInfo::from_peer(&host_peer),
        };

        let resp: Resp = self
            .request_with_retry(|| async {
                self.send(self.client.post(self.url("/parties")).json(&body))
                    .await
            })
            .await?;

        let party = resp.party.into_party()?;
        self.cache.write().parties.insert(party.party_id, party.clone());
        Ok(party)
    }

    async fn join_party(&self, party_id: PartyId, peer: Peer) -> Result<Party, MeshError> {
        #[derive(serde::Serialize)]
        struct Body {
            peer_info: PeerInfo,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            party: PartyInfo,
        }

        let body = Body {
            peer_info: PeerInfo::from_peer(&peer),
        };

        let resp: Resp = self
            .request_with_retry(|| async {
                self.send(
                    self.client
                        .post(self.url(&format!("/parties/{party_id}/join")))
                        .json(&body),
                )
                .await
            })
            .await?;

        let party = resp.party.into_party()?;
        self.cache.write().parties.insert(party.party_id, party.clone());
        Ok(party)
    }

    async fn leave_party(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            #[allow(dead_code)]
            status: String,
        }

        let _: Resp = self
            .request_with_retry(|| async {
                self.send(
                    self.client
                        .delete(self.url(&format!("/parties/{party_id}/peers/{peer_id}"))),
                )
                .await
            })
            .await?;
        Ok(())
    }

    async fn update_peer(&self, party_id: PartyId, peer: Peer) -> Result<(), MeshError> {
        // The HTTP surface has no dedicated update-peer endpoint; the
        // heartbeat endpoint already refreshes `last_seen` idempotently,
        // which is the only field this contract promises to refresh.
        self.heartbeat(party_id, peer.peer_id).await
    }

    async fn get_peers(&self, party_id: PartyId) -> Result<Vec<Peer>, MeshError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            peers: Vec<PeerInfo>,
        }

        let result = self
            .request_with_retry(|| async {
                self.send::<Resp>(self.client.get(self.url(&format!("/parties/{party_id}/peers"))))
                    .await
            })
            .await;

        match result {
            Ok(resp) => resp
                .peers
                .into_iter()
                .map(|p| p.into_peer(party_id))
                .collect(),
            Err(error) if self.is_degraded() => {
                tracing::warn!(%error, "serving cached peers while degraded");
                Ok(self
                    .cache
                    .read()
                    .parties
                    .get(&party_id)
                    .map(|p| p.peers.values().cloned().collect())
                    .unwrap_or_default())
            }
            Err(error) => Err(error),
        }
    }

    async fn discover_peer(&self, party_id: PartyId, peer_id: PeerId) -> Result<Peer, MeshError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            peer: PeerInfo,
        }

        let resp: Resp = self
            .request_with_retry(|| async {
                self.send(
                    self.client
                        .get(self.url(&format!("/parties/{party_id}/peers/{peer_id}"))),
                )
                .await
            })
            .await?;
        resp.peer.into_peer(party_id)
    }

    async fn heartbeat(&self, party_id: PartyId, peer_id: PeerId) -> Result<(), MeshError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            #[allow(dead_code)]
            status: String,
        }

        let _: Resp = self
            .request_with_retry(|| async {
                self.send(self.client.post(self.url(&format!(
                    "/parties/{party_id}/peers/{peer_id}/heartbeat"
                ))))
                .await
            })
            .await?;
        Ok(())
    }

    async fn list_relays(&self) -> Result<Vec<RelayRecord>, MeshError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            relays: Vec<RelayRecord>,
        }

        let resp: Resp = self
            .request_with_retry(|| async { self.send(self.client.get(self.url("/relays"))).await })
            .await?;
        Ok(resp.relays)
    }
}

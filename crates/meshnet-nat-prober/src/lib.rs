//! NAT Prober (spec.md §4.1): STUN-based reflexive address discovery and
//! NAT-type classification.
//!
//! Grounded in the teacher's `snownet::stun_binding` module, which speaks
//! the same `stun_codec` RFC 5389 Binding Request/Response dialect. We drop
//! `stun_binding`'s SANS-IO state machine shape (it exists there to plug
//! into a hand-rolled event loop shared with ICE) in favor of a plain
//! `async fn`, because spec.md §4.1 specifies a one-shot `detect()`
//! contract rather than a long-lived candidate that keeps itself fresh.

use bytecodec::{DecodeExt as _, EncodeExt as _};
use meshnet_model::{Endpoint, NatClass};
use std::net::SocketAddr;
use std::time::Duration;
use stun_codec::rfc5389::attributes::{MappedAddress, XorMappedAddress};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Per-attempt STUN timeout (spec.md §4.1 "Timeouts: 2 seconds per server
/// attempt, up to three servers before failing").
pub const PER_SERVER_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_SERVERS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum NatProbeError {
    #[error("no STUN server responded within the attempt budget")]
    NetworkUnreachable,
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NatProbeResult {
    pub reflexive_endpoint: Endpoint,
    pub nat_class: NatClass,
}

#[derive(Debug, Clone)]
pub struct NatProberConfig {
    /// STUN servers in probing order: user-provided entries first, then
    /// built-in defaults (spec.md §4.1 "order: user-provided → defaults").
    pub stun_servers: Vec<SocketAddr>,
}

impl NatProberConfig {
    pub fn with_user_servers(user_servers: Vec<SocketAddr>) -> Self {
        let mut stun_servers = user_servers;
        stun_servers.extend(default_stun_servers());
        Self { stun_servers }
    }
}

impl Default for NatProberConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

fn default_stun_servers() -> Vec<SocketAddr> {
    // Well-known public STUN servers, resolved ahead of time to sidestep a
    // DNS dependency in the hot path. Operators are expected to override
    // these with servers closer to their deployment via
    // `NatProberConfig::with_user_servers`.
    vec![
        SocketAddr::from(([74, 125, 250, 129], 19302)), // stun.l.google.com
        SocketAddr::from(([77, 72, 174, 165], 3478)),   // stun.sipgate.net
    ]
}

/// Runs the NAT detection procedure of spec.md §4.1 on `socket`, which must
/// already be bound to the local port that will be used by the tunnel
/// device, so the reflexive mapping observed is the one the tunnel will
/// actually use.
pub async fn detect(
    socket: &UdpSocket,
    config: &NatProberConfig,
) -> Result<NatProbeResult, NatProbeError> {
    let local_port = socket.local_addr()?.port();

    let servers_to_try: Vec<SocketAddr> = config
        .stun_servers
        .iter()
        .copied()
        .take(MAX_SERVERS)
        .collect();

    let first = probe_first_responder(socket, &servers_to_try).await?;

    let mut nat_class = classify(first.reflexive, first.local_ip, local_port);

    // Symmetric detection (spec.md §4.1): only meaningful when the single
    // probe's heuristic landed on the conservative `port-restricted-cone`
    // guess; `open`/`full-cone` are already unambiguous from one
    // observation.
    if nat_class == NatClass::PortRestrictedCone {
        if let Some(second_server) = servers_to_try
            .iter()
            .find(|addr| *addr != &first.server)
            .copied()
        {
            if let Ok(second) = probe_one(socket, second_server).await {
                if second.reflexive.port() != first.reflexive.port() {
                    nat_class = NatClass::Symmetric;
                }
            }
        }
    }

    Ok(NatProbeResult {
        reflexive_endpoint: first.reflexive.into(),
        nat_class,
    })
}

fn classify(reflexive: SocketAddr, local_ip: std::net::IpAddr, local_port: u16) -> NatClass {
    if reflexive.ip() == local_ip {
        NatClass::Open
    } else if reflexive.port() == local_port {
        NatClass::FullCone
    } else {
        NatClass::PortRestrictedCone
    }
}

struct ProbeOutcome {
    server: SocketAddr,
    reflexive: SocketAddr,
    local_ip: std::net::IpAddr,
}

async fn probe_first_responder(
    socket: &UdpSocket,
    servers: &[SocketAddr],
) -> Result<ProbeOutcome, NatProbeError> {
    for server in servers {
        match probe_one(socket, *server).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) => {
                tracing::debug!(%server, %error, "STUN server did not respond, trying next");
            }
        }
    }
    Err(NatProbeError::NetworkUnreachable)
}

async fn probe_one(socket: &UdpSocket, server: SocketAddr) -> Result<ProbeOutcome, NatProbeError> {
    let local_ip = socket.local_addr()?.ip();

    let request = Message::<stun_codec::rfc5389::Attribute>::new(
        MessageClass::Request,
        BINDING,
        TransactionId::new(rand::random()),
    );
    let expected_id = request.transaction_id();
    let bytes = MessageEncoder::default()
        .encode_into_bytes(request)
        .expect("a Binding Request with no attributes always encodes");

    socket.send_to(&bytes, server).await?;

    let mut buf = [0u8; 512];
    let deadline = PER_SERVER_TIMEOUT;

    loop {
        let (len, from) = timeout(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NatProbeError::NetworkUnreachable)??;

        if from != server {
            continue; // spec.md §4.1: only trust the server we addressed.
        }

        let Ok(message) =
            MessageDecoder::<stun_codec::rfc5389::Attribute>::default().decode_from_bytes(&buf[..len])
        else {
            continue;
        };
        let Ok(message) = message else { continue };

        if message.transaction_id() != expected_id {
            continue; // mismatched transaction, per spec.md §4.1 discard it.
        }

        let reflexive = message
            .get_attribute::<XorMappedAddress>()
            .map(|a| a.address())
            .or_else(|| {
                message
                    .get_attribute::<MappedAddress>()
                    .map(|a| a.address())
            });

        let Some(reflexive) = reflexive else {
            continue;
        };

        return Ok(ProbeOutcome {
            server,
            reflexive,
            local_ip,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_reflexive_ip_matches_local() {
        let local = std::net::IpAddr::from([10, 0, 0, 1]);
        let reflexive = SocketAddr::new(local, 51820);
        assert_eq!(classify(reflexive, local, 51820), NatClass::Open);
    }

    #[test]
    fn full_cone_when_port_preserved_but_ip_rewritten() {
        let local = std::net::IpAddr::from([10, 0, 0, 1]);
        let reflexive = SocketAddr::new(std::net::IpAddr::from([1, 2, 3, 4]), 51820);
        assert_eq!(classify(reflexive, local, 51820), NatClass::FullCone);
    }

    #[test]
    fn port_restricted_cone_is_the_conservative_default() {
        let local = std::net::IpAddr::from([10, 0, 0, 1]);
        let reflexive = SocketAddr::new(std::net::IpAddr::from([1, 2, 3, 4]), 40000);
        assert_eq!(
            classify(reflexive, local, 51820),
            NatClass::PortRestrictedCone
        );
    }
}

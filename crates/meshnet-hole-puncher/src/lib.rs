//! Hole Puncher (spec.md §4.2): simultaneous-open UDP hole punching.
//!
//! The wire protocol here is intentionally tiny compared to the teacher's
//! ICE-based connectivity checks (`snownet`'s `str0m::IceAgent`) — spec.md
//! §4.2 defines a fixed two-datagram handshake, not STUN connectivity
//! checks, so there is nothing to gain from reusing `str0m`. What's kept
//! from the teacher is the shape of the event loop: a retry ticker racing
//! against an inbound-datagram listener on the same socket, the same
//! pattern `snownet::stun_binding` uses for its request/response cycle.

use meshnet_model::Endpoint;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, interval};

pub const PROBE_PAYLOAD: &[u8] = b"LANrage-HOLEPUNCH-v1\0";
pub const ACK_PAYLOAD: &[u8] = b"LANrage-HOLEPUNCH-ACK-v1\0";

const PROBE_COUNT: u32 = 5;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("hole punch to peer failed within the timeout budget")]
pub struct HolePunchFailed;

/// Attempts simultaneous-open UDP hole punching against
/// `peer_reflexive_endpoint` on `socket`.
///
/// Returns the endpoint an ACK was actually observed from, which may differ
/// in port from `peer_reflexive_endpoint` if the peer's NAT rebound
/// (spec.md §4.2 "NAT rebinding tolerance").
pub async fn punch(
    socket: &UdpSocket,
    peer_reflexive_endpoint: Endpoint,
) -> Result<Endpoint, HolePunchFailed> {
    let target: SocketAddr = peer_reflexive_endpoint.into();

    let deadline = Instant::now() + TOTAL_TIMEOUT;
    let mut probe_ticker = interval(PROBE_INTERVAL);
    let mut probes_sent = 0u32;
    let mut seen_probe_sources: HashSet<SocketAddr> = HashSet::new();

    let mut buf = [0u8; PROBE_PAYLOAD.len().max(ACK_PAYLOAD.len())];

    loop {
        tokio::select! {
            _ = probe_ticker.tick(), if probes_sent < PROBE_COUNT => {
                let _ = socket.send_to(PROBE_PAYLOAD, target).await;
                probes_sent += 1;
            }
            result = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = result else {
                    continue;
                };
                let payload = &buf[..len];

                if payload == ACK_PAYLOAD {
                    // spec.md §4.2: duplicate ACKs are ignored, i.e. the
                    // first one observed wins and we stop.
                    return Ok(from.into());
                }

                if payload == PROBE_PAYLOAD {
                    if from != target && seen_probe_sources.contains(&from) {
                        continue; // already acked this unexpected source once
                    }
                    if from != target {
                        // spec.md §4.2 says probes from unexpected sources
                        // are dropped; we still ack the expected target
                        // even if it differs in port (rebinding), since the
                        // "source" in that case is still our intended peer
                        // by IP.
                        if from.ip() != target.ip() {
                            continue;
                        }
                    }
                    seen_probe_sources.insert(from);
                    let _ = socket.send_to(ACK_PAYLOAD, from).await;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(HolePunchFailed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn punch_succeeds_when_peer_replies_with_ack() {
        let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], PROBE_PAYLOAD);
            peer.send_to(ACK_PAYLOAD, from).await.unwrap();
        });

        let result = punch(&local, peer_addr.into()).await;
        assert!(result.is_ok());
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn punch_times_out_when_nobody_replies() {
        let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let dead_target = Endpoint::new(Ipv4Addr::LOCALHOST.into(), 1); // nobody listens on port 1

        let result = punch(&local, dead_target).await;
        assert_eq!(result, Err(HolePunchFailed));
    }

    #[tokio::test]
    async fn tolerates_peer_rebinding_to_a_different_port() {
        let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        // The endpoint we were told about via the control plane before the
        // peer's NAT rebound. We still send probes there, but nothing needs
        // to be listening on it for this test.
        let declared_target = Endpoint::new(Ipv4Addr::LOCALHOST.into(), 1);

        // The peer's NAT has since rebound to a fresh port; it acks us from
        // there directly, without us ever learning that port up front.
        let rebound_peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let rebound_addr = rebound_peer.local_addr().unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(async move {
            rebound_peer
                .send_to(ACK_PAYLOAD, local_addr)
                .await
                .unwrap();
        });

        let observed = punch(&local, declared_target).await.unwrap();
        assert_eq!(observed, rebound_addr.into());
        assert_ne!(observed, declared_target);
    }
}

//! Connection Coordinator (spec.md §4.4): decides whether a peer pair can
//! connect directly, attempts the hole punch, and falls back to a relay.
//!
//! Grounded in `snownet::Node`'s candidate-pair selection, which also picks
//! between a direct path and a relayed path based on what connectivity
//! checks succeed — simplified here to a single up-front NAT-compatibility
//! check plus one hole-punch attempt, per spec.md §4.4's simpler contract
//! (no continuous ICE-style re-checking of every candidate pair).

use meshnet_hole_puncher::{HolePunchFailed, punch};
use meshnet_model::{Endpoint, NatClass, Strategy};
use meshnet_relay_selector::{NoRelayAvailable, RelayProber, choose_relay};
use tokio::net::UdpSocket;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no viable connection strategy: direct not permitted or failed, and {0}")]
pub struct NoStrategyAvailable(#[from] NoRelayAvailable);

/// Decides and executes a connection strategy for one peer. `socket` must
/// already be bound to the port the tunnel device uses, matching the one
/// the NAT Prober used to classify `local_nat_class`.
pub async fn coordinate(
    socket: &UdpSocket,
    local_nat_class: NatClass,
    peer_nat_class: NatClass,
    peer_reflexive_endpoint: Endpoint,
    relay_candidates: &[Endpoint],
    relay_prober: &dyn RelayProber,
) -> Result<Strategy, NoStrategyAvailable> {
    if local_nat_class.permits_direct_with(peer_nat_class) {
        match punch(socket, peer_reflexive_endpoint).await {
            Ok(observed) => return Ok(Strategy::Direct(observed)),
            Err(HolePunchFailed) => {
                tracing::debug!(%peer_reflexive_endpoint, "hole punch failed, falling back to relay");
            }
        }
    }

    let (relay_endpoint, _rtt) = choose_relay(relay_candidates, relay_prober).await?;
    Ok(Strategy::Relay(relay_endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    struct AlwaysReachable;
    #[async_trait]
    impl RelayProber for AlwaysReachable {
        async fn probe_rtt(&self, _endpoint: Endpoint) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }
    }

    #[tokio::test]
    async fn falls_back_to_relay_when_direct_not_permitted() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let dead_peer = endpoint(1);
        let relays = [endpoint(9000)];

        let strategy = coordinate(
            &socket,
            NatClass::Symmetric,
            NatClass::Symmetric,
            dead_peer,
            &relays,
            &AlwaysReachable,
        )
        .await
        .unwrap();

        assert_eq!(strategy, Strategy::Relay(endpoint(9000)));
    }

    #[tokio::test]
    async fn falls_back_to_relay_when_hole_punch_fails() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let dead_peer = endpoint(1); // nobody listens, punch will time out
        let relays = [endpoint(9000)];

        let strategy = coordinate(
            &socket,
            NatClass::Open,
            NatClass::Open,
            dead_peer,
            &relays,
            &AlwaysReachable,
        )
        .await
        .unwrap();

        assert_eq!(strategy, Strategy::Relay(endpoint(9000)));
    }

    #[tokio::test]
    async fn succeeds_direct_when_peer_acks() {
        let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            let _ = len;
            peer.send_to(meshnet_hole_puncher::ACK_PAYLOAD, from)
                .await
                .unwrap();
        });

        let strategy = coordinate(
            &local,
            NatClass::Open,
            NatClass::Open,
            peer_addr.into(),
            &[],
            &AlwaysReachable,
        )
        .await
        .unwrap();

        assert_eq!(strategy, Strategy::Direct(peer_addr.into()));
    }
}

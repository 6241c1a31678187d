//! Relay Registry/Selector (spec.md §4.3).
//!
//! There is no direct teacher analogue for RTT-based relay ranking (the
//! teacher's relays are TURN allocations chosen by the ICE agent's own
//! candidate-pair priority math), so this module is grounded more loosely:
//! the `RelayProber` trait seam and the "probe real sockets, but let tests
//! inject a fake" split follows the same shape as
//! `meshnet-nat-prober`/`meshnet-hole-puncher`, and the UDP ping/pong wire
//! format mirrors the hole puncher's fixed-payload probes (spec.md §4.2)
//! rather than inventing a new style.

use async_trait::async_trait;
use meshnet_model::Endpoint;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const PING_PAYLOAD: &[u8] = b"LANrage-RELAY-PING-v1\0";
pub const PONG_PAYLOAD: &[u8] = b"pong";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const PROBE_SAMPLES: usize = 3;
/// Default relay-switch margin (spec.md §4.3): a new candidate must beat the
/// current one by at least 20% to be worth the disruption of switching.
pub const DEFAULT_SWITCH_MARGIN: f64 = 0.20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no relay candidate responded within the probe budget")]
pub struct NoRelayAvailable;

/// Measures round-trip time to a candidate relay. A trait so the selector's
/// ranking logic can be tested without binding real sockets.
#[async_trait]
pub trait RelayProber: Send + Sync {
    async fn probe_rtt(&self, endpoint: Endpoint) -> Option<Duration>;
}

/// Builds the ordered, deduplicated candidate list of spec.md §4.3:
/// control-plane-advertised relays, then the statically configured relay,
/// then the built-in default, each only once even if it appears in
/// multiple sources.
pub fn build_candidate_list(
    control_plane_relays: impl IntoIterator<Item = Endpoint>,
    static_relay: Option<Endpoint>,
    builtin_default: Endpoint,
) -> Vec<Endpoint> {
    let mut seen = std::collections::HashSet::new();
    control_plane_relays
        .into_iter()
        .chain(static_relay)
        .chain(std::iter::once(builtin_default))
        .filter(|endpoint| seen.insert(*endpoint))
        .collect()
}

/// Measures the mean RTT to `endpoint` over [`PROBE_SAMPLES`] samples,
/// treating any sample that doesn't get a reply within [`PROBE_TIMEOUT`] as
/// missing; returns `None` (excluded) only if *no* sample got a reply.
async fn mean_rtt(prober: &dyn RelayProber, endpoint: Endpoint) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut replies = 0u32;

    for _ in 0..PROBE_SAMPLES {
        if let Some(sample) = prober.probe_rtt(endpoint).await {
            total += sample;
            replies += 1;
        }
    }

    if replies == 0 {
        return None;
    }

    Some(total / replies)
}

/// Picks the lowest-mean-RTT reachable candidate, breaking ties by listed
/// order (spec.md §4.3).
pub async fn choose_relay(
    candidates: &[Endpoint],
    prober: &dyn RelayProber,
) -> Result<(Endpoint, Duration), NoRelayAvailable> {
    let mut best: Option<(Endpoint, Duration)> = None;

    for &candidate in candidates {
        let Some(rtt) = mean_rtt(prober, candidate).await else {
            continue;
        };

        best = match best {
            Some((_, best_rtt)) if rtt >= best_rtt => best,
            _ => Some((candidate, rtt)),
        };
    }

    best.ok_or(NoRelayAvailable)
}

/// Proposes a replacement for `current` (spec.md §4.3 "Runtime switching").
/// A switch only commits if the new candidate's RTT is strictly lower than
/// `current_last_rtt` by at least `margin` (e.g. `0.20` == 20%).
pub async fn switch_relay(
    candidates: &[Endpoint],
    current: Endpoint,
    current_last_rtt: Duration,
    exclude: Endpoint,
    margin: f64,
    prober: &dyn RelayProber,
) -> Option<(Endpoint, Duration)> {
    let pool: Vec<Endpoint> = candidates
        .iter()
        .copied()
        .filter(|c| *c != exclude && *c != current)
        .collect();

    let (candidate, rtt) = choose_relay(&pool, prober).await.ok()?;

    let threshold = current_last_rtt.as_secs_f64() * (1.0 - margin);
    if rtt.as_secs_f64() < threshold {
        Some((candidate, rtt))
    } else {
        None
    }
}

/// Real [`RelayProber`] backed by a UDP ping/pong round trip.
pub struct UdpRelayProber {
    socket: UdpSocket,
}

impl UdpRelayProber {
    pub async fn bind() -> std::io::Result<Self> {
        let socket = meshnet_socket_factory::udp(SocketAddr::new(
            std::net::Ipv4Addr::UNSPECIFIED.into(),
            0,
        ))?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl RelayProber for UdpRelayProber {
    async fn probe_rtt(&self, endpoint: Endpoint) -> Option<Duration> {
        let target: SocketAddr = endpoint.into();
        let started = tokio::time::Instant::now();

        self.socket.send_to(PING_PAYLOAD, target).await.ok()?;

        let mut buf = [0u8; 16];
        let (len, from) = timeout(PROBE_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;

        if from != target || &buf[..len] != PONG_PAYLOAD {
            return None;
        }

        Some(started.elapsed())
    }
}

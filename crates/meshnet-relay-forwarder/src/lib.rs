//! Stateless Relay Forwarder (spec.md §4.10).
//!
//! A blind UDP relay: it never terminates or inspects tunnel traffic
//! beyond the thin identity header in [`frame`], and it holds no
//! cryptographic key material of its own. Clients earn a table entry the
//! moment a packet from them is observed; the table maps a tunnel public
//! key to "the endpoint it was last seen at" so that later packets
//! addressed to that key know where to go.

pub mod frame;

use dashmap::DashMap;
use meshnet_model::TunnelPublicKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default ceiling on distinct tunnel keys the forwarder will track at
/// once, per spec.md §4.10 "bounded client table, default 1000 entries".
pub const DEFAULT_MAX_CLIENTS: usize = 1000;
/// Entries idle longer than this are reaped, per spec.md §4.10 "stale
/// clients are evicted after 5 minutes of inactivity".
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How often the reaper sweeps the table, per spec.md §4.10 "every 60
/// seconds".
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct ClientEntry {
    source_endpoint: SocketAddr,
    last_activity: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderConfig {
    pub max_clients: usize,
    pub stale_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

/// What the caller should do with a datagram after [`Forwarder::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Forward the verbatim datagram to this endpoint.
    Forward(SocketAddr),
    /// No table entry for the destination, or the frame was malformed;
    /// per spec.md §9's Open Question resolution, the default policy is
    /// to silently drop rather than broadcast to the whole party.
    Drop,
}

/// The relay's in-memory client table plus admission and eviction policy.
pub struct Forwarder {
    clients: DashMap<TunnelPublicKey, ClientEntry>,
    config: ForwarderConfig,
    rejected_new_clients: AtomicU64,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            rejected_new_clients: AtomicU64::new(0),
        }
    }

    /// Number of distinct tunnel keys currently tracked.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Count of handshake frames rejected because the table was full and
    /// the announcing key was not already present.
    pub fn rejected_new_clients(&self) -> u64 {
        self.rejected_new_clients.load(Ordering::Relaxed)
    }

    /// Parses `datagram`, updates the client table, and decides where the
    /// verbatim bytes should go next.
    pub fn ingest(&self, datagram: &[u8], source: SocketAddr) -> Disposition {
        let parsed = match frame::parse(datagram) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%source, %error, "dropping unparseable frame");
                return Disposition::Drop;
            }
        };

        self.track(&parsed, source);

        match self.clients.get(&parsed.dest_public_key()) {
            Some(entry) => Disposition::Forward(entry.source_endpoint),
            None => Disposition::Drop,
        }
    }

    /// Records or refreshes the sender's table entry.
    ///
    /// Handshake frames announce a key explicitly; data frames only
    /// refresh an entry that already maps to `source` (spec.md §4.10:
    /// "updated on every packet whose source endpoint matches an existing
    /// entry, or whose handshake announces a new key/endpoint pairing").
    fn track(&self, parsed: &frame::ParsedFrame, source: SocketAddr) {
        match parsed {
            frame::ParsedFrame::Handshake { sender_public_key, .. } => {
                if !self.clients.contains_key(sender_public_key) && self.at_capacity() {
                    self.rejected_new_clients.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        max_clients = self.config.max_clients,
                        "rejecting new client, relay at capacity"
                    );
                    return;
                }
                self.clients.insert(
                    *sender_public_key,
                    ClientEntry {
                        source_endpoint: source,
                        last_activity: Instant::now(),
                    },
                );
            }
            frame::ParsedFrame::Data { .. } => {
                if let Some(mut entry) = self
                    .clients
                    .iter_mut()
                    .find(|entry| entry.source_endpoint == source)
                {
                    entry.last_activity = Instant::now();
                }
            }
        }
    }

    fn at_capacity(&self) -> bool {
        self.clients.len() >= self.config.max_clients
    }

    /// Drops entries idle longer than `stale_timeout`. Intended to be
    /// called on a fixed interval by the daemon's reap loop.
    pub fn reap_stale(&self) {
        let cutoff = self.config.stale_timeout;
        let now = Instant::now();
        self.clients
            .retain(|_, entry| now.duration_since(entry.last_activity) < cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn key(b: u8) -> TunnelPublicKey {
        TunnelPublicKey::from_bytes([b; 32])
    }

    fn handshake(sender: TunnelPublicKey, dest: TunnelPublicKey) -> Vec<u8> {
        let mut frame = vec![1u8];
        frame.extend_from_slice(sender.as_bytes());
        frame.extend_from_slice(dest.as_bytes());
        frame
    }

    fn data(dest: TunnelPublicKey) -> Vec<u8> {
        let mut frame = vec![3u8];
        frame.extend_from_slice(dest.as_bytes());
        frame.extend_from_slice(b"payload");
        frame
    }

    #[test]
    fn handshake_learns_sender_endpoint_then_data_forwards_to_it() {
        let forwarder = Forwarder::new(ForwarderConfig::default());

        let disposition = forwarder.ingest(&handshake(key(1), key(2)), endpoint(9001));
        assert_eq!(disposition, Disposition::Drop); // key(2) not seen yet.

        forwarder.ingest(&handshake(key(2), key(1)), endpoint(9002));

        let disposition = forwarder.ingest(&data(key(2)), endpoint(9001));
        assert_eq!(disposition, Disposition::Forward(endpoint(9002)));
    }

    #[test]
    fn drops_frame_with_no_known_destination() {
        let forwarder = Forwarder::new(ForwarderConfig::default());
        let disposition = forwarder.ingest(&data(key(9)), endpoint(1234));
        assert_eq!(disposition, Disposition::Drop);
    }

    #[test]
    fn drops_malformed_frame() {
        let forwarder = Forwarder::new(ForwarderConfig::default());
        assert_eq!(forwarder.ingest(&[7u8], endpoint(1234)), Disposition::Drop);
    }

    #[test]
    fn rejects_new_client_once_at_capacity() {
        let config = ForwarderConfig {
            max_clients: 1,
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config);

        forwarder.ingest(&handshake(key(1), key(1)), endpoint(1));
        assert_eq!(forwarder.client_count(), 1);

        forwarder.ingest(&handshake(key(2), key(2)), endpoint(2));
        assert_eq!(forwarder.client_count(), 1);
        assert_eq!(forwarder.rejected_new_clients(), 1);
    }

    #[test]
    fn existing_client_refreshed_even_at_capacity() {
        let config = ForwarderConfig {
            max_clients: 1,
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config);

        forwarder.ingest(&handshake(key(1), key(1)), endpoint(1));
        forwarder.ingest(&handshake(key(1), key(1)), endpoint(1));
        assert_eq!(forwarder.client_count(), 1);
        assert_eq!(forwarder.rejected_new_clients(), 0);
    }

    #[test]
    fn reap_stale_evicts_idle_entries() {
        let config = ForwarderConfig {
            stale_timeout: Duration::from_millis(0),
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config);
        forwarder.ingest(&handshake(key(1), key(1)), endpoint(1));
        assert_eq!(forwarder.client_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        forwarder.reap_stale();
        assert_eq!(forwarder.client_count(), 0);
    }
}

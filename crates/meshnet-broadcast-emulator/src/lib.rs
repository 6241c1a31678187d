//! Broadcast / Multicast Emulator (spec.md §4.11).
//!
//! Makes peers on a mesh behave as if they shared a physical LAN segment
//! for legacy discovery protocols (SSDP, LAN game browsers, and the
//! like), which broadcast/multicast on a real LAN but have no way to
//! reach a peer over a point-to-point mesh tunnel. The Emulator captures
//! such traffic locally, tunnels it to every other peer, and re-injects it
//! on their end with the original ports preserved.
//!
//! Grounded in the same "narrow external collaborator" shape as
//! `meshnet-tun`: the Emulator only ever reads peer virtual addresses
//! through [`TunnelDevice::allowed_addresses`] (spec.md §3 "Ownership"),
//! never mutates tunnel peer entries.

pub mod dedup;
pub mod envelope;
pub mod queue;

use dashmap::DashMap;
use dedup::DedupWindow;
use envelope::Envelope;
use meshnet_tun::TunnelDevice;
use parking_lot::Mutex;
use queue::OutboundQueue;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Arbitrary internal port dedicated to inter-Emulator envelope traffic,
/// distinct from any discovery port so it never collides with the
/// protocols being emulated (spec.md §4.11 "a dedicated internal UDP
/// port").
pub const DEFAULT_INTERNAL_FORWARD_PORT: u16 = 54211;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// This host's virtual address on the mesh, used for loop prevention
    /// and as the bind address for the internal forward socket.
    pub local_virtual_address: Ipv4Addr,
    /// Ports to capture broadcast discovery traffic on, taken from a game
    /// profile (spec.md §4.11 "for each configured discovery port").
    pub discovery_ports: Vec<u16>,
    /// `(group, port)` pairs to join and capture multicast traffic on.
    pub multicast_groups: Vec<(Ipv4Addr, u16)>,
    /// Port used for envelope traffic between Emulators. `0` binds an
    /// ephemeral port, resolved after bind.
    pub internal_forward_port: u16,
    /// Address injected packets are sent to on the local segment, usually
    /// the mesh subnet's broadcast address.
    pub local_broadcast_address: Ipv4Addr,
    pub dedup_window: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            local_virtual_address: Ipv4Addr::UNSPECIFIED,
            discovery_ports: Vec::new(),
            multicast_groups: Vec::new(),
            internal_forward_port: DEFAULT_INTERNAL_FORWARD_PORT,
            local_broadcast_address: Ipv4Addr::BROADCAST,
            dedup_window: dedup::DEFAULT_WINDOW,
            outbound_queue_capacity: queue::DEFAULT_CAPACITY,
        }
    }
}

struct PeerQueue {
    queue: OutboundQueue,
    notify: Notify,
}

/// A UDP-bound broadcast/multicast capture-and-relay point. One instance
/// per process, sharing the [`TunnelDevice`] with the Connection Manager
/// but never mutating it.
pub struct Emulator {
    tun: Arc<dyn TunnelDevice>,
    config: EmulatorConfig,
    forward_socket: Arc<UdpSocket>,
    forward_port: u16,
    inject_sockets: DashMap<u16, Arc<UdpSocket>>,
    dedup: Mutex<DedupWindow>,
    outbound_queues: DashMap<IpAddr, Arc<PeerQueue>>,
}

impl Emulator {
    /// Binds all configured listeners and the internal forward socket, and
    /// spawns the background capture and forwarding tasks.
    pub async fn spawn(tun: Arc<dyn TunnelDevice>, config: EmulatorConfig) -> std::io::Result<Arc<Self>> {
        let forward_socket = meshnet_socket_factory::udp(SocketAddr::new(
            IpAddr::V4(config.local_virtual_address),
            config.internal_forward_port,
        ))?;
        let forward_port = forward_socket.local_addr()?.port();

        let emulator = Arc::new(Self {
            tun,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            forward_socket: Arc::new(forward_socket),
            forward_port,
            inject_sockets: DashMap::new(),
            outbound_queues: DashMap::new(),
            config,
        });

        for &port in &emulator.config.discovery_ports {
            let listener = meshnet_socket_factory::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
            tokio::spawn(capture_loop(emulator.clone(), Arc::new(listener), port));
        }

        for &(group, port) in &emulator.config.multicast_groups {
            let listener = meshnet_socket_factory::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
            meshnet_socket_factory::join_multicast_v4(&listener, group, emulator.config.local_virtual_address)?;
            tokio::spawn(capture_loop(emulator.clone(), Arc::new(listener), port));
        }

        tokio::spawn(forward_receive_loop(emulator.clone()));

        Ok(emulator)
    }

    /// Number of peers currently holding a pending outbound queue, exposed
    /// for tests and diagnostics.
    pub fn tracked_peer_count(&self) -> usize {
        self.outbound_queues.len()
    }

    fn enqueue_for_peer(self: &Arc<Self>, peer_addr: IpAddr, envelope: Vec<u8>) {
        let peer_queue = self
            .outbound_queues
            .entry(peer_addr)
            .or_insert_with(|| {
                let peer_queue = Arc::new(PeerQueue {
                    queue: OutboundQueue::new(self.config.outbound_queue_capacity),
                    notify: Notify::new(),
                });
                tokio::spawn(drain_loop(self.clone(), peer_addr, peer_queue.clone()));
                peer_queue
            })
            .clone();

        if peer_queue.queue.push(envelope) {
            tracing::debug!(%peer_addr, "outbound broadcast queue full, dropped oldest datagram");
        }
        peer_queue.notify.notify_one();
    }

    async fn ensure_inject_socket(&self, port: u16) -> std::io::Result<Arc<UdpSocket>> {
        if let Some(socket) = self.inject_sockets.get(&port) {
            return Ok(socket.clone());
        }

        let socket = meshnet_socket_factory::udp(SocketAddr::new(
            IpAddr::V4(self.config.local_virtual_address),
            port,
        ))?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        self.inject_sockets.insert(port, socket.clone());
        Ok(socket)
    }

    async fn inject(&self, envelope: &Envelope) -> std::io::Result<()> {
        let socket = self.ensure_inject_socket(envelope.original_source_port).await?;
        let dest = SocketAddr::new(
            IpAddr::V4(self.config.local_broadcast_address),
            envelope.original_dest_port,
        );
        socket.send_to(&envelope.payload, dest).await?;
        Ok(())
    }
}

async fn capture_loop(emulator: Arc<Emulator>, listener: Arc<UdpSocket>, port: u16) {
    let mut buf = vec![0u8; 65536];
    let local_virtual_address = IpAddr::V4(emulator.config.local_virtual_address);

    loop {
        let (len, source) = match listener.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, port, "broadcast emulator listener recv failed");
                continue;
            }
        };

        // Loop prevention: never recapture a packet this same process just
        // injected onto the local segment (spec.md §4.11).
        if source.ip() == local_virtual_address {
            continue;
        }

        let payload = &buf[..len];
        let is_new = emulator
            .dedup
            .lock()
            .check_and_insert(payload, source.ip(), Instant::now());
        if !is_new {
            continue;
        }

        let envelope = Envelope {
            original_source_port: source.port(),
            original_dest_port: port,
            payload: payload.to_vec(),
        }
        .encode();

        for peer_addr in emulator.tun.allowed_addresses() {
            if peer_addr == local_virtual_address {
                continue;
            }
            emulator.enqueue_for_peer(peer_addr, envelope.clone());
        }
    }
}

async fn drain_loop(emulator: Arc<Emulator>, peer_addr: IpAddr, peer_queue: Arc<PeerQueue>) {
    let dest = SocketAddr::new(peer_addr, emulator.forward_port);
    loop {
        while let Some(item) = peer_queue.queue.pop() {
            if let Err(error) = emulator.forward_socket.send_to(&item, dest).await {
                tracing::warn!(%peer_addr, %error, "failed to forward broadcast envelope");
            }
        }
        peer_queue.notify.notified().await;
    }
}

async fn forward_receive_loop(emulator: Arc<Emulator>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, source) = match emulator.forward_socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, "broadcast emulator forward socket recv failed");
                continue;
            }
        };

        let envelope = match Envelope::decode(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::debug!(%error, %source, "dropping malformed broadcast envelope");
                continue;
            }
        };

        let is_new =
            emulator
                .dedup
                .lock()
                .check_and_insert(&envelope.payload, source.ip(), Instant::now());
        if !is_new {
            continue;
        }

        if let Err(error) = emulator.inject(&envelope).await {
            tracing::warn!(%error, "failed to inject broadcast envelope onto local segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_model::{Endpoint, TunnelPublicKey};
    use meshnet_tun::{InMemoryTunnelDevice, PeerConfig};
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    fn key(b: u8) -> TunnelPublicKey {
        TunnelPublicKey::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn captured_datagram_round_trips_through_forward_and_inject() {
        let tun = Arc::new(InMemoryTunnelDevice::new());
        // A single-process loopback test: the "peer" virtual address is
        // this same host, so the envelope we forward comes right back
        // through our own inject path.
        tun.upsert_peer(PeerConfig {
            public_key: key(1),
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST).into(), 51820),
            allowed_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        })
        .await
        .unwrap();

        let inject_listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let inject_port = inject_listener.local_addr().unwrap().port();

        let config = EmulatorConfig {
            local_virtual_address: Ipv4Addr::new(10, 99, 0, 1), // distinct from LOCALHOST: capture mustn't treat the sender as "self".
            discovery_ports: vec![],
            multicast_groups: vec![],
            internal_forward_port: 0,
            local_broadcast_address: Ipv4Addr::LOCALHOST,
            dedup_window: Duration::from_secs(2),
            outbound_queue_capacity: 8,
        };

        let emulator = Emulator::spawn(tun.clone(), config).await.unwrap();

        let capture_listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let capture_port = capture_listener.local_addr().unwrap().port();
        tokio::spawn(capture_loop(emulator.clone(), Arc::new(capture_listener), inject_port));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(b"discovery-probe", (Ipv4Addr::LOCALHOST, capture_port))
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let (len, _) = timeout(Duration::from_secs(2), inject_listener.recv_from(&mut buf))
            .await
            .expect("injected packet should arrive within timeout")
            .unwrap();

        assert_eq!(&buf[..len], b"discovery-probe");
    }

    #[tokio::test]
    async fn duplicate_datagram_within_window_is_forwarded_once() {
        let tun = Arc::new(InMemoryTunnelDevice::new());
        tun.upsert_peer(PeerConfig {
            public_key: key(2),
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST).into(), 51820),
            allowed_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        })
        .await
        .unwrap();

        let config = EmulatorConfig {
            local_virtual_address: Ipv4Addr::new(10, 99, 0, 1),
            discovery_ports: vec![],
            multicast_groups: vec![],
            internal_forward_port: 0,
            local_broadcast_address: Ipv4Addr::LOCALHOST,
            dedup_window: Duration::from_secs(2),
            outbound_queue_capacity: 8,
        };
        let emulator = Emulator::spawn(tun, config).await.unwrap();

        // A bare listener standing in for the peer's own forward socket,
        // bound to the same port on loopback instead of the emulator's
        // virtual address.
        let peer_listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, emulator.forward_port))
            .await
            .unwrap();

        let capture_listener = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let capture_port = capture_listener.local_addr().unwrap().port();
        tokio::spawn(capture_loop(emulator.clone(), capture_listener, 1900));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        for _ in 0..3 {
            sender
                .send_to(b"ssdp-msearch", (Ipv4Addr::LOCALHOST, capture_port))
                .await
                .unwrap();
        }

        let mut buf = vec![0u8; 256];
        let (len, _) = timeout(Duration::from_secs(2), peer_listener.recv_from(&mut buf))
            .await
            .expect("first forwarded envelope should arrive")
            .unwrap();
        let envelope = Envelope::decode(&buf[..len]).unwrap();
        assert_eq!(envelope.payload, b"ssdp-msearch");

        // The other two sends were duplicates within the dedup window and
        // must not have been forwarded.
        let second = timeout(Duration::from_millis(200), peer_listener.recv_from(&mut buf)).await;
        assert!(second.is_err(), "duplicate datagrams must not be forwarded again");
    }
}

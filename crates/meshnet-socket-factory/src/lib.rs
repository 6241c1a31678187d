//! UDP socket construction, adapted from the teacher's `socket-factory`
//! crate. Dropped relative to the teacher: the `quinn_udp`-based GSO/GRO
//! "perf socket" fast path and the TCP half (this system is UDP-only per
//! spec.md §1 "Non-goals: ... TCP fallback"), both noted in DESIGN.md.
//! Kept: the `SocketFactory` trait seam, so callers (the NAT prober, the
//! hole puncher, the relay forwarder, the broadcast emulator) can be
//! exercised in tests against a fake factory instead of real sockets.

use std::io;
use std::net::SocketAddr;

/// Binds a socket of type `S` to a local address. A trait rather than a
/// bare function so call sites can be generic over "however we get a
/// socket" and tests can substitute a factory that binds to ephemeral
/// loopback ports deterministically.
pub trait SocketFactory<S>: Send + Sync + 'static {
    fn bind(&self, local: SocketAddr) -> io::Result<S>;
}

impl<F, S> SocketFactory<S> for F
where
    F: Fn(SocketAddr) -> io::Result<S> + Send + Sync + 'static,
{
    fn bind(&self, local: SocketAddr) -> io::Result<S> {
        (self)(local)
    }
}

/// Binds a non-blocking UDP socket, permitting simultaneous binds to the
/// same port from multiple sockets where the platform allows it
/// (`SO_REUSEADDR`), which the Broadcast/Multicast Emulator relies on
/// (spec.md §4.11 "binds a UDP socket in permissive mode").
pub fn udp(addr: SocketAddr) -> io::Result<tokio::net::UdpSocket> {
    let sock_addr = socket2::SockAddr::from(addr);
    let socket = socket2::Socket::new(sock_addr.domain(), socket2::Type::DGRAM, None)?;

    if sock_addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr)?;

    let std_socket = std::net::UdpSocket::from(socket);
    tokio::net::UdpSocket::from_std(std_socket)
}

/// Joins a multicast group on the given local interface, used by the
/// Broadcast/Multicast Emulator (spec.md §4.11).
pub fn join_multicast_v4(
    socket: &tokio::net::UdpSocket,
    group: std::net::Ipv4Addr,
    interface: std::net::Ipv4Addr,
) -> io::Result<()> {
    socket.join_multicast_v4(group, interface)
}

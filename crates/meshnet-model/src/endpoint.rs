use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A network endpoint, `(ip, port)`, where `ip` may be IPv4 or IPv6.
///
/// spec.md §3 distinguishes four *flavors* of endpoint (reflexive-public,
/// declared-local, assigned-relay, active) by where they come from and how
/// they're used, not by shape — so we keep a single concrete type here and
/// let field names at the call site (`reflexive_endpoint`, `active_endpoint`,
/// ...) carry that meaning, the same way the teacher's codebase treats a
/// `SocketAddr` as meaning different things depending on which struct field
/// holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddr::new(endpoint.ip, endpoint.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}

use crate::{PartyId, PeerId};

/// The error taxonomy of spec.md §7, as a single concrete enum.
///
/// Individual crates are free to define their own narrower `thiserror`
/// enums for internal use (e.g. `meshnet-nat-prober::NatProbeError`) and
/// convert into this umbrella type at the boundary where spec.md says the
/// error becomes visible to a caller (`Connection Manager::connect`, the
/// control-plane server's HTTP responses, ...). Kinds describe *what went
/// wrong*, not which module it came from.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("party {0} not found")]
    PartyNotFound(PartyId),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("virtual address pool exhausted")]
    AddressPoolExhausted,

    #[error("no relay available")]
    NoRelayAvailable,

    #[error("tunnel device error: {0}")]
    TunnelDeviceError(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl MeshError {
    /// Whether a caller should retry this error with backoff, per spec.md §7
    /// ("The Control Plane remote client retries `Transient` ...").
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::Transient(_) | MeshError::NetworkUnreachable(_))
    }
}

use base64::Engine as _;
use std::fmt;

const KEY_LEN: usize = 32;

/// A Curve25519 public key, the cryptographic identity of a peer.
///
/// Serialized as base64 in every control-plane message and persisted
/// snapshot, per spec.md §3.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelPublicKey([u8; KEY_LEN]);

impl TunnelPublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for TunnelPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base64::engine::general_purpose::STANDARD.encode(self.0))
    }
}

impl fmt::Debug for TunnelPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelKeyError {
    #[error("not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("expected {KEY_LEN} bytes, got {0}")]
    WrongLength(usize),
}

impl std::str::FromStr for TunnelPublicKey {
    type Err = TunnelKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(s)?;
        let len = decoded.len();
        let bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| TunnelKeyError::WrongLength(len))?;
        Ok(Self(bytes))
    }
}

impl serde::Serialize for TunnelPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for TunnelPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

//! Wire framing the Relay Forwarder inspects (spec.md §4.10).
//!
//! The relay never decrypts tunnel traffic; it only reads a thin,
//! plaintext identity header. Every frame carries the destination's
//! public key so forwarding is always a table lookup (spec.md §9 leaves a
//! "forward to everyone in the party" fallback as optional for protocols
//! that omit a destination field — ours doesn't, so that fallback is
//! never needed; the spec default of "drop if no association" still
//! applies when the destination has no table entry). Handshake frames
//! additionally carry the sender's static public key, the only place the
//! wire format exposes a plaintext sender identity, which is how the
//! relay learns `key -> endpoint`.

use meshnet_model::TunnelPublicKey;

const KEY_LEN: usize = 32;
/// `kind(1B) | sender_static_public_key(32B) | dest_public_key(32B)`.
const HANDSHAKE_HEADER_LEN: usize = 1 + KEY_LEN + KEY_LEN;
/// `kind(1B) | dest_public_key(32B)`, followed by the opaque payload.
const DATA_HEADER_LEN: usize = 1 + KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    HandshakeInit,
    HandshakeResponse,
    Data,
}

impl FrameKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameKind::HandshakeInit),
            2 => Some(FrameKind::HandshakeResponse),
            3 => Some(FrameKind::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedFrame {
    Handshake {
        kind: FrameKind,
        sender_public_key: TunnelPublicKey,
        dest_public_key: TunnelPublicKey,
    },
    Data {
        dest_public_key: TunnelPublicKey,
    },
}

impl ParsedFrame {
    pub fn dest_public_key(&self) -> TunnelPublicKey {
        match self {
            ParsedFrame::Handshake { dest_public_key, .. } => *dest_public_key,
            ParsedFrame::Data { dest_public_key } => *dest_public_key,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,
    #[error("unknown frame kind tag {0}")]
    UnknownKind(u8),
}

fn read_key(bytes: &[u8]) -> TunnelPublicKey {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes[..KEY_LEN]);
    TunnelPublicKey::from_bytes(key)
}

pub fn parse(datagram: &[u8]) -> Result<ParsedFrame, FrameError> {
    let &[tag, ..] = datagram else {
        return Err(FrameError::TooShort);
    };
    let kind = FrameKind::from_tag(tag).ok_or(FrameError::UnknownKind(tag))?;

    match kind {
        FrameKind::HandshakeInit | FrameKind::HandshakeResponse => {
            if datagram.len() < HANDSHAKE_HEADER_LEN {
                return Err(FrameError::TooShort);
            }
            Ok(ParsedFrame::Handshake {
                kind,
                sender_public_key: read_key(&datagram[1..]),
                dest_public_key: read_key(&datagram[1 + KEY_LEN..]),
            })
        }
        FrameKind::Data => {
            if datagram.len() < DATA_HEADER_LEN {
                return Err(FrameError::TooShort);
            }
            Ok(ParsedFrame::Data {
                dest_public_key: read_key(&datagram[1..]),
            })
        }
    }
}

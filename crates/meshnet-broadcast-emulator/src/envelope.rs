//! The fixed wire envelope carrying a captured broadcast/multicast datagram
//! across the tunnel to another peer's Emulator (spec.md §4.11).

const MAGIC: [u8; 4] = *b"LRBE";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 2 + 2 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub original_source_port: u16,
    pub original_dest_port: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope shorter than the fixed header")]
    TooShort,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("declared payload length {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: u16, actual: usize },
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&self.original_source_port.to_be_bytes());
        bytes.extend_from_slice(&self.original_dest_port.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::TooShort);
        }
        if bytes[0..4] != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        let original_source_port = u16::from_be_bytes([bytes[5], bytes[6]]);
        let original_dest_port = u16::from_be_bytes([bytes[7], bytes[8]]);
        let payload_len = u16::from_be_bytes([bytes[9], bytes[10]]) as usize;
        let payload = &bytes[HEADER_LEN..];

        if payload.len() != payload_len {
            return Err(EnvelopeError::LengthMismatch {
                declared: payload_len as u16,
                actual: payload.len(),
            });
        }

        Ok(Self {
            original_source_port,
            original_dest_port,
            payload: payload.to_vec(),
        })
    }
}

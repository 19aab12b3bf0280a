use sha3::{Digest, Keccak256};
use ulid::Ulid;

use super::IngestError;

/// Solidity signature of the escrow's payment event.
pub const PAID_EVENT_SIGNATURE: &str = "Paid(string,address,uint256)";

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// `topics[0]` of every payment log.
pub fn paid_event_topic() -> [u8; 32] {
    keccak256(PAID_EVENT_SIGNATURE.as_bytes())
}

/// Public stand-in for an appointment id: keccak-256 of the id's string
/// form, which is what the escrow contract indexes when a customer pays.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub [u8; 32]);

impl CorrelationId {
    pub fn for_appointment(id: &Ulid) -> Self {
        Self(keccak256(id.to_string().as_bytes()))
    }

    pub fn from_hex(s: &str) -> Result<Self, IngestError> {
        parse_word(s).map(Self)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", to_hex(&self.0))
    }
}

impl std::fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// Decode hex with an optional `0x` prefix.
pub fn from_hex(s: &str) -> Result<Vec<u8>, IngestError> {
    hex::decode(strip_0x(s)).map_err(|_| IngestError::InvalidHex(s.to_owned()))
}

/// Decode exactly one 32-byte EVM word.
pub fn parse_word(s: &str) -> Result<[u8; 32], IngestError> {
    let mut word = [0u8; 32];
    hex::decode_to_slice(strip_0x(s), &mut word)
        .map_err(|_| IngestError::InvalidHex(s.to_owned()))?;
    Ok(word)
}

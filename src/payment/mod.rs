//! Payment reconciliation.
//!
//! Payments are made on-chain against an escrow contract that emits
//! `Paid(string indexed appointmentId, address indexed customer, uint256 cost)`.
//! The indexed string arrives only as its keccak-256 hash, so matching works
//! by hashing every pending appointment id the same way and comparing.
//!
//! Logs reach us through a [`PaymentFeed`]; the [`Reconciler`] turns each one
//! into at most one `PendingPayment → Reserved` transition. A webhook entry
//! point does the same for callers that cannot hold a subscription open.

mod correlation;
mod feed;
mod reconciler;

pub use correlation::{keccak256, paid_event_topic, to_hex, CorrelationId, PAID_EVENT_SIGNATURE};
pub use feed::{ChannelFeed, LineFeed, PaymentFeed};
pub use reconciler::{follow_feed, MatchOutcome, Reconciler, WebhookError};

use serde::{Deserialize, Serialize};

use correlation::parse_word;

/// An EVM log as delivered by a JSON-RPC subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    #[serde(default)]
    pub address: Option<String>,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// A decoded payment confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub correlation_id: CorrelationId,
    pub payer: String,
    pub amount: u128,
}

#[derive(Debug)]
pub enum IngestError {
    Json(String),
    LineTooLong,
    UnknownSignature(String),
    MissingTopic(usize),
    InvalidHex(String),
    InvalidAddress(String),
    AmountOverflow,
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Json(e) => write!(f, "malformed log: {e}"),
            IngestError::LineTooLong => write!(f, "log line too long"),
            IngestError::UnknownSignature(t) => write!(f, "not a payment event: {t}"),
            IngestError::MissingTopic(i) => write!(f, "missing topic {i}"),
            IngestError::InvalidHex(s) => write!(f, "invalid hex: {s}"),
            IngestError::InvalidAddress(s) => write!(f, "invalid address word: {s}"),
            IngestError::AmountOverflow => write!(f, "amount does not fit in 128 bits"),
        }
    }
}

impl std::error::Error for IngestError {}

impl PaymentEvent {
    /// Decode a `Paid` log: topics are `[signature, id hash, payer]`, data is
    /// the amount as one big-endian word.
    pub fn from_log(log: &RawLog) -> Result<Self, IngestError> {
        let topic = |i: usize| log.topics.get(i).ok_or(IngestError::MissingTopic(i));

        let signature = parse_word(topic(0)?)?;
        if signature != paid_event_topic() {
            return Err(IngestError::UnknownSignature(topic(0)?.clone()));
        }
        let correlation_id = CorrelationId::from_hex(topic(1)?)?;

        let payer_word = parse_word(topic(2)?)?;
        if payer_word[..12].iter().any(|b| *b != 0) {
            return Err(IngestError::InvalidAddress(topic(2)?.clone()));
        }
        let payer = format!("0x{}", to_hex(&payer_word[12..]));

        let amount_word = parse_word(&log.data)?;
        if amount_word[..16].iter().any(|b| *b != 0) {
            return Err(IngestError::AmountOverflow);
        }
        let mut low = [0u8; 16];
        low.copy_from_slice(&amount_word[16..]);

        Ok(Self {
            correlation_id,
            payer,
            amount: u128::from_be_bytes(low),
        })
    }

    /// Build the log the escrow would emit for this payment.
    pub fn to_log(&self, contract: Option<&str>) -> RawLog {
        let mut payer_word = [0u8; 32];
        if let Ok(addr) = correlation::from_hex(&self.payer)
            && addr.len() == 20
        {
            payer_word[12..].copy_from_slice(&addr);
        }
        let mut amount_word = [0u8; 32];
        amount_word[16..].copy_from_slice(&self.amount.to_be_bytes());
        RawLog {
            address: contract.map(str::to_owned),
            topics: vec![
                format!("0x{}", to_hex(&paid_event_topic())),
                self.correlation_id.to_string(),
                format!("0x{}", to_hex(&payer_word)),
            ],
            data: format!("0x{}", to_hex(&amount_word)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const PAYER: &str = "0x00000000000000000000000000000000000000aa";

    fn paid(amount: u128) -> PaymentEvent {
        PaymentEvent {
            correlation_id: CorrelationId::for_appointment(&Ulid::new()),
            payer: PAYER.into(),
            amount,
        }
    }

    #[test]
    fn decodes_emitted_log() {
        let event = paid(100);
        let decoded = PaymentEvent::from_log(&event.to_log(None)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_other_event_signatures() {
        let mut log = paid(1).to_log(None);
        log.topics[0] = format!("0x{}", to_hex(&keccak256(b"Refund(string,address,uint256)")));
        assert!(matches!(
            PaymentEvent::from_log(&log),
            Err(IngestError::UnknownSignature(_))
        ));
    }

    #[test]
    fn rejects_missing_topics() {
        let mut log = paid(1).to_log(None);
        log.topics.truncate(2);
        assert!(matches!(PaymentEvent::from_log(&log), Err(IngestError::MissingTopic(2))));
    }

    #[test]
    fn rejects_dirty_address_padding() {
        let mut log = paid(1).to_log(None);
        log.topics[2] = format!("0x{}", "ff".repeat(32));
        assert!(matches!(
            PaymentEvent::from_log(&log),
            Err(IngestError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_oversized_amount() {
        let mut log = paid(1).to_log(None);
        log.data = format!("0x{}", "ff".repeat(32));
        assert!(matches!(PaymentEvent::from_log(&log), Err(IngestError::AmountOverflow)));
    }

    #[test]
    fn parses_json_log() {
        let event = paid(5);
        let json = serde_json::to_string(&event.to_log(Some("0xescrow"))).unwrap();
        let log: RawLog = serde_json::from_str(&json).unwrap();
        assert_eq!(log.address.as_deref(), Some("0xescrow"));
        assert_eq!(PaymentEvent::from_log(&log).unwrap(), event);
    }
}

//! Ledger events observed by the monitor
//!
//! Contract events and their layout:
//!
//! ```text
//! CertificateIssued(uint256 indexed tokenId, address indexed tourist, string destination)
//! PointsEarned(address indexed user, uint256 amount, string description)
//! PointsRedeemed(address indexed user, uint256 amount, string description)
//! BookingCreated(bytes32 indexed bookingHash, address indexed tourist, address indexed provider)
//! BookingVerified(bytes32 indexed bookingHash, address indexed tourist, address indexed provider)
//! ```

use chrono::{DateTime, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::common::{format_address, format_h256, normalize_tx_hash, parse_address, PayloadHash};
use super::operation::{CanonicalPayload, ContractRole, OperationKind};
use crate::error::{LedgerError, LedgerResult};

/// Raw log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// Subscribed event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CertificateIssued,
    PointsEarned,
    PointsRedeemed,
    BookingCreated,
    BookingVerified,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::CertificateIssued,
        EventKind::PointsEarned,
        EventKind::PointsRedeemed,
        EventKind::BookingCreated,
        EventKind::BookingVerified,
    ];

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::CertificateIssued => "CertificateIssued(uint256,address,string)",
            EventKind::PointsEarned => "PointsEarned(address,uint256,string)",
            EventKind::PointsRedeemed => "PointsRedeemed(address,uint256,string)",
            EventKind::BookingCreated => "BookingCreated(bytes32,address,address)",
            EventKind::BookingVerified => "BookingVerified(bytes32,address,address)",
        }
    }

    /// keccak256 of the signature
    pub fn topic0(&self) -> H256 {
        H256::from(keccak256(self.signature().as_bytes()))
    }

    /// Operation this event confirms
    pub fn operation_kind(&self) -> OperationKind {
        match self {
            EventKind::CertificateIssued => OperationKind::MintCertificate,
            EventKind::PointsEarned => OperationKind::EarnPoints,
            EventKind::PointsRedeemed => OperationKind::RedeemPoints,
            EventKind::BookingCreated | EventKind::BookingVerified => OperationKind::VerifyBooking,
        }
    }

    pub fn contract_role(&self) -> ContractRole {
        self.operation_kind().contract_role()
    }

    /// Events emitted by a contract
    pub fn for_contract(role: ContractRole) -> &'static [EventKind] {
        match role {
            ContractRole::Certificates => &[EventKind::CertificateIssued],
            ContractRole::Loyalty => &[EventKind::PointsEarned, EventKind::PointsRedeemed],
            ContractRole::Booking => &[EventKind::BookingCreated, EventKind::BookingVerified],
            ContractRole::Reviews => &[],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.signature().split('(').next().unwrap_or_default();
        f.write_str(name)
    }
}

/// Decoded event arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventArgs {
    Certificate {
        token_id: u64,
        tourist: String,
        destination: String,
    },
    Points {
        user: String,
        amount: u64,
        description: String,
    },
    Booking {
        /// 0x-prefixed 32-byte hash assigned by the contract
        booking_hash: String,
        tourist: String,
        provider: String,
    },
}

impl EventArgs {
    /// Payload hash of the operation these arguments confirm.
    /// Must agree with [`crate::types::Operation::payload_hash`].
    pub fn payload_hash(&self, kind: EventKind) -> PayloadHash {
        let mut canon = CanonicalPayload::new(kind.operation_kind());
        match self {
            EventArgs::Certificate { tourist, destination, .. } => {
                canon.address(tourist).text(destination);
            }
            EventArgs::Points { user, amount, description } => match kind {
                EventKind::PointsRedeemed => {
                    canon.address(user).amount(*amount).text(description);
                }
                _ => {
                    canon.address(user).text(description);
                }
            },
            EventArgs::Booking { tourist, provider, .. } => {
                canon.address(tourist).address(provider);
            }
        }
        canon.finish()
    }
}

/// An event observed on the ledger. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: EventKind,
    /// Emitting contract, lowercase 0x form
    pub contract: String,
    pub args: EventArgs,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub observed_at: DateTime<Utc>,
}

impl LedgerEvent {
    /// Decode a raw log of the given kind
    pub fn decode(kind: EventKind, log: &LogEntry) -> LedgerResult<Self> {
        match log.topics.first() {
            Some(topic) if *topic == kind.topic0() => {}
            _ => {
                return Err(LedgerError::EventDecode(format!(
                    "log {}:{} is not a {} event",
                    log.tx_hash, log.log_index, kind
                )))
            }
        }

        let args = match kind {
            EventKind::CertificateIssued => {
                let token_id = u256_to_u64(U256::from_big_endian(topic(log, 1)?.as_bytes()))?;
                let tourist = topic_address(topic(log, 2)?);
                let mut tokens = abi::decode(&[ParamType::String], &log.data)?.into_iter();
                EventArgs::Certificate {
                    token_id,
                    tourist: format_address(&tourist),
                    destination: next_string(&mut tokens)?,
                }
            }
            EventKind::PointsEarned | EventKind::PointsRedeemed => {
                let user = topic_address(topic(log, 1)?);
                let mut tokens =
                    abi::decode(&[ParamType::Uint(256), ParamType::String], &log.data)?.into_iter();
                let amount = match tokens.next().and_then(Token::into_uint) {
                    Some(v) => u256_to_u64(v)?,
                    None => return Err(LedgerError::EventDecode("missing amount".to_string())),
                };
                EventArgs::Points {
                    user: format_address(&user),
                    amount,
                    description: next_string(&mut tokens)?,
                }
            }
            EventKind::BookingCreated | EventKind::BookingVerified => EventArgs::Booking {
                booking_hash: format_h256(topic(log, 1)?),
                tourist: format_address(&topic_address(topic(log, 2)?)),
                provider: format_address(&topic_address(topic(log, 3)?)),
            },
        };

        Ok(Self {
            kind,
            contract: format_address(&log.address),
            args,
            block_number: log.block_number,
            tx_hash: normalize_tx_hash(&log.tx_hash),
            log_index: log.log_index,
            observed_at: Utc::now(),
        })
    }

    pub fn operation_kind(&self) -> OperationKind {
        self.kind.operation_kind()
    }

    pub fn payload_hash(&self) -> PayloadHash {
        self.args.payload_hash(self.kind)
    }

    /// Encode back to the raw log layout the contract emits
    pub fn to_log_entry(&self) -> LedgerResult<LogEntry> {
        let contract = parse_address(&self.contract)
            .ok_or_else(|| LedgerError::EventDecode(format!("bad contract {}", self.contract)))?;
        let mut topics = vec![self.kind.topic0()];
        let data = match &self.args {
            EventArgs::Certificate { token_id, tourist, destination } => {
                let mut buf = [0u8; 32];
                U256::from(*token_id).to_big_endian(&mut buf);
                topics.push(H256::from(buf));
                topics.push(address_topic(tourist)?);
                abi::encode(&[Token::String(destination.clone())])
            }
            EventArgs::Points { user, amount, description } => {
                topics.push(address_topic(user)?);
                abi::encode(&[Token::Uint(U256::from(*amount)), Token::String(description.clone())])
            }
            EventArgs::Booking { booking_hash, tourist, provider } => {
                let hash = super::common::digest_from_hex(booking_hash)?;
                topics.push(H256::from(hash));
                topics.push(address_topic(tourist)?);
                topics.push(address_topic(provider)?);
                Vec::new()
            }
        };
        Ok(LogEntry {
            address: contract,
            topics,
            data,
            block_number: self.block_number,
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        })
    }
}

fn topic(log: &LogEntry, index: usize) -> LedgerResult<&H256> {
    log.topics.get(index).ok_or_else(|| {
        LedgerError::EventDecode(format!(
            "log {}:{} missing topic {}",
            log.tx_hash, log.log_index, index
        ))
    })
}

fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

fn address_topic(address: &str) -> LedgerResult<H256> {
    let address = parse_address(address)
        .ok_or_else(|| LedgerError::EventDecode(format!("bad address {}", address)))?;
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(address.as_bytes());
    Ok(H256::from(buf))
}

fn next_string(tokens: &mut impl Iterator<Item = Token>) -> LedgerResult<String> {
    tokens
        .next()
        .and_then(Token::into_string)
        .ok_or_else(|| LedgerError::EventDecode("missing string argument".to_string()))
}

pub fn u256_to_u64(value: U256) -> LedgerResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(LedgerError::EventDecode(format!("value {} overflows u64", value)));
    }
    Ok(value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    const USER: &str = "0x00000000000000000000000000000000000000aa";
    const LOYALTY: &str = "0x0000000000000000000000000000000000000b02";

    fn points_event(kind: EventKind, amount: u64, description: &str) -> LedgerEvent {
        LedgerEvent {
            kind,
            contract: LOYALTY.to_string(),
            args: EventArgs::Points {
                user: USER.to_string(),
                amount,
                description: description.to_string(),
            },
            block_number: 42,
            tx_hash: "0xfeed".to_string(),
            log_index: 3,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_topic0_is_keccak_of_signature() {
        let expected = H256::from(keccak256(b"PointsEarned(address,uint256,string)"));
        assert_eq!(EventKind::PointsEarned.topic0(), expected);
        assert_ne!(EventKind::BookingCreated.topic0(), EventKind::BookingVerified.topic0());
    }

    #[test]
    fn test_decode_points_earned() {
        let event = points_event(EventKind::PointsEarned, 50, "booking B9");
        let log = event.to_log_entry().unwrap();
        assert_eq!(log.topics.len(), 2);

        let decoded = LedgerEvent::decode(EventKind::PointsEarned, &log).unwrap();
        assert_eq!(decoded.args, event.args);
        assert_eq!(decoded.contract, LOYALTY);
        assert_eq!(decoded.block_number, 42);
        assert_eq!(decoded.operation_kind(), OperationKind::EarnPoints);
    }

    #[test]
    fn test_decode_rejects_wrong_topic() {
        let log = points_event(EventKind::PointsEarned, 50, "booking B9")
            .to_log_entry()
            .unwrap();
        let err = LedgerEvent::decode(EventKind::PointsRedeemed, &log).unwrap_err();
        assert!(matches!(err, LedgerError::EventDecode(_)));
    }

    #[test]
    fn test_decode_booking_uses_indexed_topics() {
        let event = LedgerEvent {
            kind: EventKind::BookingVerified,
            contract: "0x0000000000000000000000000000000000000b03".to_string(),
            args: EventArgs::Booking {
                booking_hash: format!("0x{}", "11".repeat(32)),
                tourist: USER.to_string(),
                provider: "0x00000000000000000000000000000000000000bb".to_string(),
            },
            block_number: 7,
            tx_hash: "0xbeef".to_string(),
            log_index: 0,
            observed_at: Utc::now(),
        };
        let log = event.to_log_entry().unwrap();
        assert!(log.data.is_empty());
        let decoded = LedgerEvent::decode(EventKind::BookingVerified, &log).unwrap();
        assert_eq!(decoded.args, event.args);
    }

    #[test]
    fn test_event_payload_hash_matches_operation() {
        let earned = points_event(EventKind::PointsEarned, 50, "booking B9");
        let earn = Operation::EarnPoints {
            entity_id: "U1".to_string(),
            user: "0x00000000000000000000000000000000000000AA".to_string(),
            booking_amount: 5000,
            description: "booking B9".to_string(),
        };
        assert_eq!(earned.payload_hash(), earn.payload_hash());

        let redeemed = points_event(EventKind::PointsRedeemed, 150, "voucher");
        let redeem = Operation::RedeemPoints {
            entity_id: "U1".to_string(),
            user: USER.to_string(),
            points: 150,
            description: "voucher".to_string(),
        };
        assert_eq!(redeemed.payload_hash(), redeem.payload_hash());
    }

    #[test]
    fn test_u256_overflow_is_rejected() {
        assert_eq!(u256_to_u64(U256::from(9u64)).unwrap(), 9);
        assert!(u256_to_u64(U256::from(u64::MAX) + U256::from(1u64)).is_err());
    }
}

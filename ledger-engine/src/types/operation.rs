//! Operation - typed domain requests submitted to the ledger
//!
//! Every request the CRUD layer can make is one variant of [`Operation`].
//! Each variant carries the off-chain `entity_id` it acts on behalf of
//! (booking id, user id, review id).
//!
//! # Payload hash
//!
//! ```text
//! SHA256("tourism-ledger/payload/v1" || kind || len-prefixed confirmation fields)
//! ```
//!
//! Only fields that are recoverable from the confirming ledger event take
//! part, so the same digest can be derived from either side (see
//! [`crate::types::EventArgs::payload_hash`]).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::common::{compute_digest, normalize_address, PayloadHash};

/// Domain separator for payload hashing
pub const PAYLOAD_DOMAIN: &[u8] = b"tourism-ledger/payload/v1";

/// Operation submitted on behalf of an off-chain entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Mint a tour-completion certificate NFT
    MintCertificate {
        entity_id: String,
        tourist: String,
        destination: String,
        tour_date: String,
    },
    /// Award loyalty points for a booking
    EarnPoints {
        entity_id: String,
        user: String,
        booking_amount: u64,
        description: String,
    },
    /// Redeem loyalty points
    RedeemPoints {
        entity_id: String,
        user: String,
        points: u64,
        description: String,
    },
    /// Record a booking on chain
    VerifyBooking {
        entity_id: String,
        tourist: String,
        provider: String,
        destination: String,
        amount: u64,
        booking_date: String,
        ipfs_hash: String,
    },
    /// Record a review digest on chain
    VerifyReview {
        entity_id: String,
        review_id: String,
        /// 32-byte hex digest of the review content
        review_hash: String,
        user: String,
        destination_id: String,
    },
}

/// Operation discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    MintCertificate,
    EarnPoints,
    RedeemPoints,
    VerifyBooking,
    VerifyReview,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::MintCertificate,
        OperationKind::EarnPoints,
        OperationKind::RedeemPoints,
        OperationKind::VerifyBooking,
        OperationKind::VerifyReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::MintCertificate => "mint_certificate",
            OperationKind::EarnPoints => "earn_points",
            OperationKind::RedeemPoints => "redeem_points",
            OperationKind::VerifyBooking => "verify_booking",
            OperationKind::VerifyReview => "verify_review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Off-chain entity family this operation updates
    pub fn entity_type(&self) -> EntityType {
        match self {
            OperationKind::MintCertificate => EntityType::Certificate,
            OperationKind::EarnPoints | OperationKind::RedeemPoints => EntityType::Loyalty,
            OperationKind::VerifyBooking => EntityType::Booking,
            OperationKind::VerifyReview => EntityType::Review,
        }
    }

    /// Contract this operation is sent to
    pub fn contract_role(&self) -> ContractRole {
        match self {
            OperationKind::MintCertificate => ContractRole::Certificates,
            OperationKind::EarnPoints | OperationKind::RedeemPoints => ContractRole::Loyalty,
            OperationKind::VerifyBooking => ContractRole::Booking,
            OperationKind::VerifyReview => ContractRole::Reviews,
        }
    }

    /// Whether the contract emits an event that confirms this operation.
    /// Reviews are only observable by reading `isReviewVerified` back.
    pub fn has_confirming_event(&self) -> bool {
        !matches!(self, OperationKind::VerifyReview)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four deployed contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractRole {
    Certificates,
    Loyalty,
    Booking,
    Reviews,
}

impl ContractRole {
    pub const ALL: [ContractRole; 4] = [
        ContractRole::Certificates,
        ContractRole::Loyalty,
        ContractRole::Booking,
        ContractRole::Reviews,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractRole::Certificates => "certificates",
            ContractRole::Loyalty => "loyalty",
            ContractRole::Booking => "booking",
            ContractRole::Reviews => "reviews",
        }
    }
}

impl fmt::Display for ContractRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Off-chain entity family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Certificate,
    Loyalty,
    Booking,
    Review,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Certificate => write!(f, "certificate"),
            EntityType::Loyalty => write!(f, "loyalty"),
            EntityType::Booking => write!(f, "booking"),
            EntityType::Review => write!(f, "review"),
        }
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::MintCertificate { .. } => OperationKind::MintCertificate,
            Operation::EarnPoints { .. } => OperationKind::EarnPoints,
            Operation::RedeemPoints { .. } => OperationKind::RedeemPoints,
            Operation::VerifyBooking { .. } => OperationKind::VerifyBooking,
            Operation::VerifyReview { .. } => OperationKind::VerifyReview,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Operation::MintCertificate { entity_id, .. }
            | Operation::EarnPoints { entity_id, .. }
            | Operation::RedeemPoints { entity_id, .. }
            | Operation::VerifyBooking { entity_id, .. }
            | Operation::VerifyReview { entity_id, .. } => entity_id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.kind().entity_type()
    }

    /// Deterministic digest of the confirmation fields
    pub fn payload_hash(&self) -> PayloadHash {
        let mut canon = CanonicalPayload::new(self.kind());
        match self {
            Operation::MintCertificate { tourist, destination, .. } => {
                canon.address(tourist).text(destination);
            }
            Operation::EarnPoints { user, description, .. } => {
                canon.address(user).text(description);
            }
            Operation::RedeemPoints { user, points, description, .. } => {
                canon.address(user).amount(*points).text(description);
            }
            Operation::VerifyBooking { tourist, provider, .. } => {
                canon.address(tourist).address(provider);
            }
            Operation::VerifyReview { review_id, review_hash, .. } => {
                canon.text(review_id).text(&review_hash.trim().to_lowercase());
            }
        }
        canon.finish()
    }
}

/// Length-prefixed canonical field encoder shared by operations and events
#[derive(Debug, Clone)]
pub struct CanonicalPayload {
    buf: Vec<u8>,
}

impl CanonicalPayload {
    pub fn new(kind: OperationKind) -> Self {
        let mut canon = Self {
            buf: PAYLOAD_DOMAIN.to_vec(),
        };
        canon.text(kind.as_str());
        canon
    }

    /// Free text, taken verbatim
    pub fn text(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Address, normalized to lowercase 0x form
    pub fn address(&mut self, value: &str) -> &mut Self {
        let normalized = normalize_address(value);
        self.text(&normalized)
    }

    pub fn amount(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&8u32.to_be_bytes());
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn finish(&self) -> PayloadHash {
        compute_digest(&self.buf)
    }
}

//! Contract call builder
//!
//! Turns a typed [`Operation`] into a [`CallDescriptor`]: target contract,
//! function selector and ABI-encoded arguments. Pure; no ledger access.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, U256};
use ethers::utils::id;

use crate::config::ContractAddresses;
use crate::error::{LedgerError, LedgerResult, OperationError};
use crate::types::{digest_from_hex, parse_address, ContractRole, Operation};

pub const MINT_CERTIFICATE: &str = "mintCertificate(address,string,string)";
pub const EARN_POINTS: &str = "earnPoints(address,uint256,string)";
pub const REDEEM_POINTS: &str = "redeemPoints(address,uint256,string)";
pub const VERIFY_BOOKING: &str = "verifyBooking(address,address,string,uint256,string,string)";
pub const VERIFY_REVIEW: &str = "verifyReview(string,bytes32,address,string)";
pub const IS_REVIEW_VERIFIED: &str = "isReviewVerified(string)";

/// Encoded contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub contract: Address,
    pub role: ContractRole,
    pub signature: &'static str,
    pub selector: [u8; 4],
    pub encoded_args: Vec<u8>,
}

impl CallDescriptor {
    fn new(contract: Address, role: ContractRole, signature: &'static str, args: &[Token]) -> Self {
        Self {
            contract,
            role,
            signature,
            selector: id(signature),
            encoded_args: abi::encode(args),
        }
    }

    /// Selector followed by the encoded arguments
    pub fn calldata(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.encoded_args.len());
        data.extend_from_slice(&self.selector);
        data.extend_from_slice(&self.encoded_args);
        data
    }
}

/// Builds contract calls for operations
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    contracts: ContractAddresses,
}

impl OperationBuilder {
    pub fn new(contracts: ContractAddresses) -> Self {
        Self { contracts }
    }

    pub fn contracts(&self) -> &ContractAddresses {
        &self.contracts
    }

    /// Configured address of `role`
    pub fn contract(&self, role: ContractRole) -> Result<Address, OperationError> {
        let configured = self.contracts.get(role).ok_or_else(|| {
            OperationError::UnsupportedOperation(format!("{} contract is not configured", role))
        })?;
        parse_address(configured).ok_or_else(|| OperationError::InvalidAddress(configured.to_string()))
    }

    pub fn build(&self, operation: &Operation) -> Result<CallDescriptor, OperationError> {
        let role = operation.kind().contract_role();
        let contract = self.contract(role)?;

        let descriptor = match operation {
            Operation::MintCertificate { tourist, destination, tour_date, .. } => CallDescriptor::new(
                contract,
                role,
                MINT_CERTIFICATE,
                &[
                    Token::Address(address_arg(tourist)?),
                    Token::String(destination.clone()),
                    Token::String(tour_date.clone()),
                ],
            ),
            Operation::EarnPoints { user, booking_amount, description, .. } => CallDescriptor::new(
                contract,
                role,
                EARN_POINTS,
                &[
                    Token::Address(address_arg(user)?),
                    Token::Uint(U256::from(*booking_amount)),
                    Token::String(description.clone()),
                ],
            ),
            Operation::RedeemPoints { user, points, description, .. } => CallDescriptor::new(
                contract,
                role,
                REDEEM_POINTS,
                &[
                    Token::Address(address_arg(user)?),
                    Token::Uint(U256::from(*points)),
                    Token::String(description.clone()),
                ],
            ),
            Operation::VerifyBooking {
                tourist,
                provider,
                destination,
                amount,
                booking_date,
                ipfs_hash,
                ..
            } => CallDescriptor::new(
                contract,
                role,
                VERIFY_BOOKING,
                &[
                    Token::Address(address_arg(tourist)?),
                    Token::Address(address_arg(provider)?),
                    Token::String(destination.clone()),
                    Token::Uint(U256::from(*amount)),
                    Token::String(booking_date.clone()),
                    Token::String(ipfs_hash.clone()),
                ],
            ),
            Operation::VerifyReview {
                review_id,
                review_hash,
                user,
                destination_id,
                ..
            } => {
                let hash = digest_from_hex(review_hash.trim()).map_err(|_| {
                    OperationError::UnsupportedOperation(format!(
                        "review hash {} is not a 32-byte hex digest",
                        review_hash
                    ))
                })?;
                CallDescriptor::new(
                    contract,
                    role,
                    VERIFY_REVIEW,
                    &[
                        Token::String(review_id.clone()),
                        Token::FixedBytes(hash.to_vec()),
                        Token::Address(address_arg(user)?),
                        Token::String(destination_id.clone()),
                    ],
                )
            }
        };
        Ok(descriptor)
    }

    /// Read-only `isReviewVerified(reviewId)` call
    pub fn is_review_verified(&self, review_id: &str) -> Result<CallDescriptor, OperationError> {
        let contract = self.contract(ContractRole::Reviews)?;
        Ok(CallDescriptor::new(
            contract,
            ContractRole::Reviews,
            IS_REVIEW_VERIFIED,
            &[Token::String(review_id.to_string())],
        ))
    }
}

fn address_arg(value: &str) -> Result<Address, OperationError> {
    parse_address(value).ok_or_else(|| OperationError::InvalidAddress(value.to_string()))
}

/// Decode a single `bool` return value
pub fn decode_bool(output: &[u8]) -> LedgerResult<bool> {
    abi::decode(&[ParamType::Bool], output)?
        .into_iter()
        .next()
        .and_then(Token::into_bool)
        .ok_or_else(|| LedgerError::Abi("expected a bool return value".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    const TOURIST: &str = "0xAbC0000000000000000000000000000000000001";

    fn builder() -> OperationBuilder {
        OperationBuilder::new(EngineConfig::development().contracts)
    }

    fn mint() -> Operation {
        Operation::MintCertificate {
            entity_id: "B123".to_string(),
            tourist: TOURIST.to_string(),
            destination: "Hampi".to_string(),
            tour_date: "2026-01-15".to_string(),
        }
    }

    #[test]
    fn test_build_mint_certificate() {
        let desc = builder().build(&mint()).unwrap();
        assert_eq!(desc.role, ContractRole::Certificates);
        assert_eq!(desc.selector, id(MINT_CERTIFICATE));
        assert_eq!(desc.signature, MINT_CERTIFICATE);

        let calldata = desc.calldata();
        assert_eq!(&calldata[..4], &desc.selector);

        let tokens = abi::decode(
            &[ParamType::Address, ParamType::String, ParamType::String],
            &calldata[4..],
        )
        .unwrap();
        assert_eq!(tokens[0], Token::Address(parse_address(TOURIST).unwrap()));
        assert_eq!(tokens[1], Token::String("Hampi".to_string()));
    }

    #[test]
    fn test_missing_contract_is_unsupported() {
        let mut contracts = EngineConfig::development().contracts;
        contracts.certificates = None;
        let err = OperationBuilder::new(contracts).build(&mint()).unwrap_err();
        assert!(matches!(err, OperationError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_bad_wallet_is_invalid_address() {
        let op = Operation::EarnPoints {
            entity_id: "U1".to_string(),
            user: "0xnot-a-wallet".to_string(),
            booking_amount: 100,
            description: "booking B1".to_string(),
        };
        let err = builder().build(&op).unwrap_err();
        assert_eq!(err, OperationError::InvalidAddress("0xnot-a-wallet".to_string()));
    }

    #[test]
    fn test_build_verify_review_encodes_bytes32() {
        let op = Operation::VerifyReview {
            entity_id: "R1".to_string(),
            review_id: "R1".to_string(),
            review_hash: format!("0x{}", "ab".repeat(32)),
            user: TOURIST.to_string(),
            destination_id: "D7".to_string(),
        };
        let desc = builder().build(&op).unwrap();
        let tokens = abi::decode(
            &[
                ParamType::String,
                ParamType::FixedBytes(32),
                ParamType::Address,
                ParamType::String,
            ],
            &desc.encoded_args,
        )
        .unwrap();
        assert_eq!(tokens[1], Token::FixedBytes(vec![0xab; 32]));

        let bad = Operation::VerifyReview {
            entity_id: "R1".to_string(),
            review_id: "R1".to_string(),
            review_hash: "abc".to_string(),
            user: TOURIST.to_string(),
            destination_id: "D7".to_string(),
        };
        assert!(builder().build(&bad).is_err());
    }

    #[test]
    fn test_decode_bool() {
        assert!(decode_bool(&abi::encode(&[Token::Bool(true)])).unwrap());
        assert!(!decode_bool(&abi::encode(&[Token::Bool(false)])).unwrap());
        assert!(decode_bool(&[]).is_err());
    }
}

//! Shared primitive types

use ethers::types::{Address, H256};
use sha2::{Digest as Sha2Digest, Sha256};

/// 32-byte digest
pub type Digest32 = [u8; 32];

/// Canonical payload digest of an operation / event
pub type PayloadHash = Digest32;

/// One gwei in wei
pub const GWEI: u64 = 1_000_000_000;

/// SHA-256 of `data`
pub fn compute_digest(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}

pub fn digest_to_hex(digest: &Digest32) -> String {
    hex::encode(digest)
}

pub fn digest_from_hex(hex_str: &str) -> Result<Digest32, hex::FromHexError> {
    let bytes = hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str))?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

/// Parse a 0x-prefixed (or bare) 20-byte hex address
pub fn parse_address(s: &str) -> Option<Address> {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if body.len() != 40 {
        return None;
    }
    let bytes = hex::decode(body).ok()?;
    Some(Address::from_slice(&bytes))
}

/// Whether `s` is a well-formed ledger address
pub fn validate_address(s: &str) -> bool {
    parse_address(s).is_some()
}

/// Lowercase 0x-prefixed form of an address
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

/// Lowercase 0x-prefixed form of a 32-byte hash
pub fn format_h256(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

/// Canonical form of an address string; falls back to trimmed lowercase
/// when the input does not parse.
pub fn normalize_address(s: &str) -> String {
    match parse_address(s) {
        Some(address) => format_address(&address),
        None => s.trim().to_lowercase(),
    }
}

/// Canonical form of a transaction hash string
pub fn normalize_tx_hash(s: &str) -> String {
    let lower = s.trim().to_lowercase();
    if lower.starts_with("0x") {
        lower
    } else {
        format!("0x{}", lower)
    }
}

/// Render a wei amount as a decimal ether string (18 places, trailing zeros trimmed)
pub fn format_ether(wei: u128) -> String {
    const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;
    let whole = wei / WEI_PER_ETH;
    let frac = wei % WEI_PER_ETH;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:018}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr = parse_address("0xAbC0000000000000000000000000000000000001").unwrap();
        assert_eq!(
            format_address(&addr),
            "0xabc0000000000000000000000000000000000001"
        );
        assert!(parse_address("0x1234").is_none());
        assert!(parse_address("0xZZ00000000000000000000000000000000000001").is_none());
        assert!(!validate_address("not-an-address"));
    }

    #[test]
    fn test_normalize_tx_hash() {
        assert_eq!(normalize_tx_hash("0xABCD"), "0xabcd");
        assert_eq!(normalize_tx_hash("abcd"), "0xabcd");
    }

    #[test]
    fn test_format_ether() {
        assert_eq!(format_ether(1_000_000_000_000_000_000), "1");
        assert_eq!(format_ether(6_600_000_000_000_000), "0.0066");
        assert_eq!(format_ether(0), "0");
    }

    #[test]
    fn test_digest_from_hex_accepts_prefix() {
        let original = [0xab; 32];
        let hex_str = format!("0x{}", digest_to_hex(&original));
        assert_eq!(digest_from_hex(&hex_str).unwrap(), original);
    }
}

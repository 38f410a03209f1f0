use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};

pub const TX_HASH_BYTES: usize = 32;
pub const ADDRESS_BYTES: usize = 20;
pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_REFERENCE_ID_LEN: usize = 64;

/// 0.000001 ETH
pub const MIN_DONATION_WEI: u128 = 1_000_000_000_000;
/// 1000 ETH
pub const MAX_DONATION_WEI: u128 = 1_000_000_000_000_000_000_000;

const _: [(); 1] = [(); (MIN_DONATION_WEI < MAX_DONATION_WEI) as usize];

/// Forward-only lifecycle of a donation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DonationStatus {
    Pending,
    Confirmed,
    Allocated,
    Completed,
}

impl DonationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Allocated => "allocated",
            Self::Completed => "completed",
        }
    }

    /// The only status an administrative transition may start from.
    pub const fn predecessor(self) -> Option<Self> {
        match self {
            Self::Pending => None,
            Self::Confirmed => Some(Self::Pending),
            Self::Allocated => Some(Self::Confirmed),
            Self::Completed => Some(Self::Allocated),
        }
    }

    /// Statuses that count towards public totals.
    pub const fn settled() -> [Self; 3] {
        [Self::Confirmed, Self::Allocated, Self::Completed]
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "allocated" => Ok(Self::Allocated),
            "completed" => Ok(Self::Completed),
            other => Err(anyhow!("Unsupported donation status: {other}")),
        }
    }
}

/// Canonical form is lower-case with a `0x` prefix, as returned by nodes.
pub fn normalize_tx_hash(value: &str) -> Result<String> {
    let bytes = decode_hex_with_expected(value, TX_HASH_BYTES, "transaction hash")?;
    Ok(format!("0x{}", hex::encode(bytes)))
}

pub fn normalize_address(value: &str) -> Result<String> {
    let bytes = decode_hex_with_expected(value, ADDRESS_BYTES, "address")?;
    Ok(format!("0x{}", hex::encode(bytes)))
}

pub fn is_valid_address(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.starts_with("0x") || trimmed.starts_with("0X"))
        && normalize_address(trimmed).is_ok()
}

pub fn decode_hex_with_expected(value: &str, expected_len: usize, label: &str) -> Result<Vec<u8>> {
    assert!(expected_len > 0, "Expected length must be > 0");
    assert!(
        expected_len <= 4096,
        "Expected length exceeds defensive bound"
    );
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("{label} cannot be empty"));
    }
    let normalized = strip_hex_prefix(trimmed);
    if normalized.len() != expected_len * 2 {
        return Err(anyhow!(
            "{label} must be {expected_len} bytes of hex, got {} characters",
            normalized.len()
        ));
    }
    hex::decode(normalized).map_err(|err| anyhow!("Failed to decode {label} as hex: {err}"))
}

pub fn canonicalize_purpose(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Purpose cannot be empty"));
    }
    if trimmed.chars().count() > MAX_PURPOSE_LEN {
        return Err(anyhow!(
            "Purpose exceeds {MAX_PURPOSE_LEN} character limit"
        ));
    }
    Ok(trimmed.to_string())
}

/// School and user ids issued by the surrounding platform.
pub fn canonicalize_reference_id(value: &str, label: &str) -> Result<Option<String>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_REFERENCE_ID_LEN {
        return Err(anyhow!(
            "{label} exceeds {MAX_REFERENCE_ID_LEN} character limit"
        ));
    }
    Ok(Some(trimmed.to_string()))
}

/// Parses a wei amount given as a decimal string and enforces donation bounds.
pub fn parse_donation_amount(value: &str) -> Result<u128> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("Amount must be a whole number of wei"));
    }
    let amount: u128 = trimmed
        .parse()
        .map_err(|_| anyhow!("Amount exceeds representable range"))?;
    if amount < MIN_DONATION_WEI {
        return Err(anyhow!(
            "Amount below minimum of {MIN_DONATION_WEI} wei (0.000001 ETH)"
        ));
    }
    if amount > MAX_DONATION_WEI {
        return Err(anyhow!(
            "Amount exceeds maximum of {MAX_DONATION_WEI} wei (1000 ETH)"
        ));
    }
    Ok(amount)
}

pub fn strip_hex_prefix(value: &str) -> &str {
    if value.starts_with("0x") || value.starts_with("0X") {
        &value[2..]
    } else {
        value
    }
}

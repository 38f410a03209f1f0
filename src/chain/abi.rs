//! Decoding of `DonationReceived` logs as returned by `eth_getLogs`.
//!
//! Event layout:
//! `DonationReceived(uint256 indexed donationId, address indexed donor, uint256 amount, string purpose)`
//! - topic0: event signature hash
//! - topic1: donation id, topic2: donor (left-padded to 32 bytes)
//! - data: amount word, offset of the string, then length word and bytes

use serde::Deserialize;

use super::{ChainError, ChainLog, DonationEvent, UndecodableLog};
use crate::donation::{normalize_tx_hash, strip_hex_prefix};

pub const DONATION_RECEIVED: &str = "DonationReceived";

/// keccak256("DonationReceived(uint256,address,uint256,string)")
pub const DONATION_RECEIVED_TOPIC: &str =
    "0x3f82cd807839db80f9937063f26a2146e11e161b89613f94f6972cae64ea2e64";

const WORD: usize = 32;

/// Log object of `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Topic hash for a known contract event name.
pub fn event_topic(event_name: &str) -> Result<&'static str, ChainError> {
    match event_name {
        DONATION_RECEIVED => Ok(DONATION_RECEIVED_TOPIC),
        other => Err(ChainError::UnknownEvent(other.to_string())),
    }
}

/// Parses a JSON-RPC hex quantity such as `0x1b4`.
pub fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    let digits = strip_hex_prefix(value.trim());
    if digits.is_empty() || digits.len() > 16 {
        return Err(ChainError::decode("quantity", format!("{value:?}")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|err| ChainError::decode("quantity", format!("{value:?}: {err}")))
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Decodes one log, keeping whatever identifies it when decoding fails.
/// Returns `None` for logs that are pending or removed.
pub fn classify_log(log: &RawLog) -> Option<ChainLog> {
    match decode_donation_log(log) {
        Ok(event) => event.map(ChainLog::Donation),
        Err(err) => Some(ChainLog::Undecodable(UndecodableLog {
            transaction_hash: log
                .transaction_hash
                .as_deref()
                .map(|hash| normalize_tx_hash(hash).unwrap_or_else(|_| hash.to_string())),
            block_number: log.block_number.as_deref().and_then(|n| parse_quantity(n).ok()),
            log_index: log.log_index.as_deref().and_then(|n| parse_quantity(n).ok()),
            reason: err.to_string(),
        })),
    }
}

/// Returns `None` for logs that are not part of the canonical chain yet
/// (pending) or anymore (`removed`).
pub fn decode_donation_log(log: &RawLog) -> Result<Option<DonationEvent>, ChainError> {
    if log.removed {
        return Ok(None);
    }
    let Some(block_number) = log.block_number.as_deref() else {
        return Ok(None);
    };
    let block_number = parse_quantity(block_number)?;

    let transaction_hash = log
        .transaction_hash
        .as_deref()
        .ok_or_else(|| ChainError::decode("log", "missing transactionHash"))
        .and_then(|hash| {
            normalize_tx_hash(hash).map_err(|err| ChainError::decode("log", err.to_string()))
        })?;

    if log.topics.len() != 3 {
        return Err(ChainError::decode(
            "log",
            format!(
                "expected 3 topics for {DONATION_RECEIVED}, got {} in {transaction_hash}",
                log.topics.len()
            ),
        ));
    }
    if !log.topics[0].eq_ignore_ascii_case(DONATION_RECEIVED_TOPIC) {
        return Err(ChainError::decode(
            "log",
            format!("unexpected event topic {} in {transaction_hash}", log.topics[0]),
        ));
    }

    let donation_id = word_to_u64(&decode_word(&log.topics[1])?, "donationId")?;
    let donor_word = decode_word(&log.topics[2])?;
    if donor_word[..WORD - 20].iter().any(|byte| *byte != 0) {
        return Err(ChainError::decode("donor topic", "address is not left-padded"));
    }
    let donor_address = format!("0x{}", hex::encode(&donor_word[WORD - 20..]));

    let data = hex::decode(strip_hex_prefix(log.data.trim()))
        .map_err(|err| ChainError::decode("log data", err.to_string()))?;
    let amount = word_to_u128(read_word(&data, 0)?, "amount")?;
    let purpose = read_string(&data, 1)?;

    let log_index = log.log_index.as_deref().map(parse_quantity).transpose()?;

    Ok(Some(DonationEvent {
        donor_address,
        donation_id,
        amount,
        purpose,
        transaction_hash,
        block_number,
        log_index,
    }))
}

fn decode_word(topic: &str) -> Result<[u8; WORD], ChainError> {
    let bytes = hex::decode(strip_hex_prefix(topic.trim()))
        .map_err(|err| ChainError::decode("topic", err.to_string()))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| ChainError::decode("topic", format!("{} bytes", bytes.len())))
}

fn read_word(data: &[u8], index: usize) -> Result<&[u8], ChainError> {
    let start = index * WORD;
    data.get(start..start + WORD).ok_or_else(|| {
        ChainError::decode("log data", format!("word {index} out of bounds ({} bytes)", data.len()))
    })
}

fn read_string(data: &[u8], head_index: usize) -> Result<String, ChainError> {
    let offset = word_to_usize(read_word(data, head_index)?, "string offset")?;
    if offset % WORD != 0 {
        return Err(ChainError::decode("log data", "unaligned string offset"));
    }
    let start = offset
        .checked_add(WORD)
        .ok_or_else(|| ChainError::decode("log data", "string offset out of bounds"))?;
    let length_word = data
        .get(offset..start)
        .ok_or_else(|| ChainError::decode("log data", "string offset out of bounds"))?;
    let length = word_to_usize(length_word, "string length")?;
    let bytes = start
        .checked_add(length)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| ChainError::decode("log data", "string bytes out of bounds"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn word_to_u128(word: &[u8], label: &'static str) -> Result<u128, ChainError> {
    if word[..16].iter().any(|byte| *byte != 0) {
        return Err(ChainError::decode(label, "value exceeds 128 bits"));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

fn word_to_u64(word: &[u8], label: &'static str) -> Result<u64, ChainError> {
    let value = word_to_u128(word, label)?;
    u64::try_from(value).map_err(|_| ChainError::decode(label, "value exceeds 64 bits"))
}

fn word_to_usize(word: &[u8], label: &'static str) -> Result<usize, ChainError> {
    let value = word_to_u64(word, label)?;
    usize::try_from(value).map_err(|_| ChainError::decode(label, "value exceeds usize"))
}

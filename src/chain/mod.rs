//! Read-only view of the donation contract on an Ethereum-compatible chain.
//!
//! The mirror only talks to the chain through [`ChainSource`], which keeps the
//! JSON-RPC client in `crate::rpc` swappable for scripted sources in tests.

use async_trait::async_trait;

pub mod abi;

pub use abi::DONATION_RECEIVED;

/// A decoded `DonationReceived` log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationEvent {
    pub donor_address: String,
    pub donation_id: u64,
    /// Wei
    pub amount: u128,
    pub purpose: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub log_index: Option<u64>,
}

/// A contract log that matched the event filter but could not be decoded.
/// It is reported instead of failing the whole fetch so the mirror can skip
/// it and keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableLog {
    pub transaction_hash: Option<String>,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    pub reason: String,
}

/// One entry of a fetch, in chain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainLog {
    Donation(DonationEvent),
    Undecodable(UndecodableLog),
}

impl ChainLog {
    pub fn block_number(&self) -> Option<u64> {
        match self {
            Self::Donation(event) => Some(event.block_number),
            Self::Undecodable(log) => log.block_number,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain node unreachable: {0}")]
    Connection(String),
    #[error("RPC call {method} failed: {message}")]
    Rpc {
        method: &'static str,
        message: String,
    },
    #[error("malformed {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("event {0} is not known to the donation contract")]
    UnknownEvent(String),
}

impl ChainError {
    pub fn decode(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            what,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current chain height.
    async fn current_block_number(&self) -> Result<u64, ChainError>;

    /// Unix timestamp (seconds) of the given block.
    async fn block_timestamp(&self, block_number: u64) -> Result<i64, ChainError>;

    /// All logs of `event_name` from `from_block` through the current head,
    /// in chain order. One-shot: callers re-invoke it to see newer logs.
    ///
    /// Only transport and RPC failures fail the call; a single malformed log
    /// comes back as [`ChainLog::Undecodable`].
    async fn fetch_events(
        &self,
        event_name: &str,
        from_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError>;
}

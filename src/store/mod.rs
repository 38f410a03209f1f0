use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::DbErr;

use crate::chain::DonationEvent;
use crate::donation::DonationStatus;

#[cfg(test)]
pub mod memory;
mod postgres;

pub use postgres::PgDonationStore;

pub const MAX_LIST_LIMIT: u64 = 100;
pub const DEFAULT_LIST_LIMIT: u64 = 20;
/// Trailing window of the monthly statistics.
pub const MONTHLY_WINDOW_DAYS: i64 = 365;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("donation {0} not found")]
    NotFound(String),
    #[error("donation {id} is {current}, cannot move to {requested}")]
    InvalidTransition {
        id: i64,
        current: String,
        requested: DonationStatus,
    },
    #[error("{field} value {value} exceeds storage bounds")]
    Overflow { field: &'static str, value: String },
}

impl StoreError {
    /// Retrying the same write cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

/// Fields the chain mirror owns on a donation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfirmation {
    pub donor_address: String,
    pub donation_id: u64,
    pub amount: u128,
    pub purpose: String,
    pub block_number: u64,
    pub block_timestamp: i64,
}

impl ChainConfirmation {
    pub fn from_event(event: &DonationEvent, block_timestamp: i64) -> Self {
        Self {
            donor_address: event.donor_address.clone(),
            donation_id: event.donation_id,
            amount: event.amount,
            purpose: event.purpose.clone(),
            block_number: event.block_number,
            block_timestamp,
        }
    }
}

#[async_trait]
pub trait DonationStore: Send + Sync {
    /// Inserts a confirmed record for `tx_hash`, or merges the chain-owned
    /// fields into the existing one in a single atomic statement.
    ///
    /// Fields the chain does not own (donor id, target school, creation time)
    /// are preserved. A `pending` record becomes `confirmed`; records already
    /// past `confirmed` keep their status.
    async fn upsert_by_tx_hash(
        &self,
        tx_hash: &str,
        confirmation: &ChainConfirmation,
    ) -> Result<(), StoreError>;
}

/// Donation intent registered through the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingDonation {
    pub amount: u128,
    pub purpose: String,
    pub transaction_hash: Option<String>,
    pub donor_address: Option<String>,
    pub donor_id: Option<String>,
    pub target_school_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DonationFilter {
    pub status: Option<DonationStatus>,
    pub donor_address: Option<String>,
    pub donor_id: Option<String>,
    pub target_school_id: Option<String>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationTotals {
    pub total_amount: Decimal,
    pub total_donations: u64,
    pub schools_helped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyTotal {
    pub year: i32,
    /// 1 to 12
    pub month: u32,
    pub total_amount: Decimal,
    pub donation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonorRank {
    pub donor_address: String,
    pub total_amount: Decimal,
    pub donation_count: u64,
}

pub(crate) fn to_decimal(amount: u128) -> Result<Decimal, StoreError> {
    i128::try_from(amount)
        .ok()
        .and_then(|value| Decimal::try_from_i128_with_scale(value, 0).ok())
        .ok_or_else(|| StoreError::Overflow {
            field: "amount",
            value: amount.to_string(),
        })
}

pub(crate) fn to_i64(value: u64, field: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Overflow {
        field,
        value: value.to_string(),
    })
}

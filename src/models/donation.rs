use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::donation;
use crate::store::{DonationTotals, DonorRank, MonthlyTotal};

const WEI_DECIMALS: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonationView {
    pub id: i64,
    pub transaction_hash: Option<String>,
    pub donor_address: Option<String>,
    pub donor_id: Option<String>,
    pub donation_id: Option<i64>,
    /// Wei, as a decimal string
    pub amount_wei: String,
    pub amount_eth: String,
    pub purpose: String,
    pub target_school_id: Option<String>,
    pub block_number: Option<i64>,
    pub block_timestamp: Option<i64>,
    pub status: String,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub allocated_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<donation::Model> for DonationView {
    fn from(model: donation::Model) -> Self {
        Self {
            id: model.id,
            transaction_hash: model.transaction_hash,
            donor_address: model.donor_address,
            donor_id: model.donor_id,
            donation_id: model.donation_id,
            amount_wei: model.amount.to_string(),
            amount_eth: format_ether(model.amount),
            purpose: model.purpose,
            target_school_id: model.target_school_id,
            block_number: model.block_number,
            block_timestamp: model.block_timestamp,
            status: model.status,
            created_at: model.created_at.timestamp(),
            confirmed_at: model.confirmed_at.map(|time| time.timestamp()),
            allocated_at: model.allocated_at.map(|time| time.timestamp()),
            completed_at: model.completed_at.map(|time| time.timestamp()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDonationRequest {
    /// Wei, as a decimal string
    pub amount: String,
    pub purpose: String,
    pub transaction_hash: Option<String>,
    pub donor_address: Option<String>,
    pub donor_id: Option<String>,
    pub target_school_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DonationListQuery {
    pub status: Option<String>,
    pub donor_address: Option<String>,
    pub donor_id: Option<String>,
    pub target_school_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocateDonationRequest {
    pub school_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DonationListResponse {
    pub donations: Vec<DonationView>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonationStatsResponse {
    pub total_wei: String,
    pub total_eth: String,
    pub total_donations: u64,
    pub schools_helped: u64,
}

impl From<DonationTotals> for DonationStatsResponse {
    fn from(totals: DonationTotals) -> Self {
        Self {
            total_wei: totals.total_amount.to_string(),
            total_eth: format_ether(totals.total_amount),
            total_donations: totals.total_donations,
            schools_helped: totals.schools_helped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyDonationStats {
    pub year: i32,
    pub month: u32,
    pub total_wei: String,
    pub total_eth: String,
    pub donation_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyStatsResponse {
    pub months: Vec<MonthlyDonationStats>,
}

impl From<Vec<MonthlyTotal>> for MonthlyStatsResponse {
    fn from(totals: Vec<MonthlyTotal>) -> Self {
        let months = totals
            .into_iter()
            .map(|total| MonthlyDonationStats {
                year: total.year,
                month: total.month,
                total_wei: total.total_amount.to_string(),
                total_eth: format_ether(total.total_amount),
                donation_count: total.donation_count,
            })
            .collect();
        Self { months }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub donor_address: String,
    pub total_wei: String,
    pub total_eth: String,
    pub donation_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardResponse {
    pub donors: Vec<LeaderboardEntry>,
}

impl From<Vec<DonorRank>> for LeaderboardResponse {
    fn from(ranks: Vec<DonorRank>) -> Self {
        let donors = ranks
            .into_iter()
            .enumerate()
            .map(|(index, rank)| LeaderboardEntry {
                rank: index as u32 + 1,
                donor_address: rank.donor_address,
                total_wei: rank.total_amount.to_string(),
                total_eth: format_ether(rank.total_amount),
                donation_count: rank.donation_count,
            })
            .collect();
        Self { donors }
    }
}

/// Renders an integral wei amount in ether without floating point.
pub fn format_ether(wei: Decimal) -> String {
    let digits = wei.trunc().abs().to_string();
    let (whole, fraction) = if digits.len() > WEI_DECIMALS {
        digits.split_at(digits.len() - WEI_DECIMALS)
    } else {
        ("0", digits.as_str())
    };
    let fraction = format!("{fraction:0>WEI_DECIMALS$}");
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

//! In-process store with the same merge rules as the Postgres upsert, used to
//! drive the mirror in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::DbErr;

use super::{ChainConfirmation, DonationStore, StoreError, to_decimal, to_i64};
use crate::donation::DonationStatus;
use crate::entities::donation;

#[derive(Default)]
pub struct MemoryDonationStore {
    records: Mutex<Vec<donation::Model>>,
    failing_hashes: Mutex<HashSet<String>>,
    transient_failures: Mutex<HashMap<String, usize>>,
    writes: AtomicUsize,
}

impl MemoryDonationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<donation::Model> {
        self.records.lock().unwrap().clone()
    }

    pub fn find(&self, tx_hash: &str) -> Option<donation::Model> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.transaction_hash.as_deref() == Some(tx_hash))
            .cloned()
    }

    /// Successful upserts so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every upsert for `tx_hash` fails.
    pub fn fail_always(&self, tx_hash: &str) {
        self.failing_hashes
            .lock()
            .unwrap()
            .insert(tx_hash.to_string());
    }

    /// The next `times` upserts for `tx_hash` fail.
    pub fn fail_times(&self, tx_hash: &str, times: usize) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), times);
    }

    pub fn insert_record(
        &self,
        tx_hash: &str,
        status: DonationStatus,
        donor_id: Option<&str>,
        target_school_id: Option<&str>,
    ) -> donation::Model {
        let mut records = self.records.lock().unwrap();
        let now = Utc::now().fixed_offset();
        let record = donation::Model {
            id: records.len() as i64 + 1,
            transaction_hash: Some(tx_hash.to_string()),
            donor_address: None,
            donor_id: donor_id.map(str::to_string),
            donation_id: None,
            amount: to_decimal(1_000_000_000_000).unwrap(),
            purpose: "registered through the API".to_string(),
            target_school_id: target_school_id.map(str::to_string),
            block_number: None,
            block_timestamp: None,
            status: status.as_str().to_string(),
            created_at: now,
            confirmed_at: (status != DonationStatus::Pending).then_some(now),
            allocated_at: None,
            completed_at: None,
        };
        records.push(record.clone());
        record
    }

    fn should_fail(&self, tx_hash: &str) -> bool {
        if self.failing_hashes.lock().unwrap().contains(tx_hash) {
            return true;
        }
        let mut transient = self.transient_failures.lock().unwrap();
        match transient.get_mut(tx_hash) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl DonationStore for MemoryDonationStore {
    async fn upsert_by_tx_hash(
        &self,
        tx_hash: &str,
        confirmation: &ChainConfirmation,
    ) -> Result<(), StoreError> {
        if self.should_fail(tx_hash) {
            return Err(StoreError::Database(DbErr::Custom(format!(
                "simulated write failure for {tx_hash}"
            ))));
        }

        let amount = to_decimal(confirmation.amount)?;
        let donation_id = to_i64(confirmation.donation_id, "donation_id")?;
        let block_number = to_i64(confirmation.block_number, "block_number")?;
        let now = Utc::now().fixed_offset();

        let mut records = self.records.lock().unwrap();
        let next_id = records.len() as i64 + 1;
        match records
            .iter_mut()
            .find(|record| record.transaction_hash.as_deref() == Some(tx_hash))
        {
            Some(existing) => {
                existing.donor_address = Some(confirmation.donor_address.clone());
                existing.donation_id = Some(donation_id);
                existing.amount = amount;
                existing.purpose = confirmation.purpose.clone();
                existing.block_number = Some(block_number);
                existing.block_timestamp = Some(confirmation.block_timestamp);
                if existing.status == DonationStatus::Pending.as_str() {
                    existing.status = DonationStatus::Confirmed.as_str().to_string();
                }
                existing.confirmed_at.get_or_insert(now);
            }
            None => records.push(donation::Model {
                id: next_id,
                transaction_hash: Some(tx_hash.to_string()),
                donor_address: Some(confirmation.donor_address.clone()),
                donor_id: None,
                donation_id: Some(donation_id),
                amount,
                purpose: confirmation.purpose.clone(),
                target_school_id: None,
                block_number: Some(block_number),
                block_timestamp: Some(confirmation.block_timestamp),
                status: DonationStatus::Confirmed.as_str().to_string(),
                created_at: now,
                confirmed_at: Some(now),
                allocated_at: None,
                completed_at: None,
            }),
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(block_number: u64) -> ChainConfirmation {
        ChainConfirmation {
            donor_address: "0x1111111111111111111111111111111111111111".to_string(),
            donation_id: 3,
            amount: 5_000_000_000_000_000,
            purpose: "lab equipment".to_string(),
            block_number,
            block_timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryDonationStore::new();
        store.upsert_by_tx_hash("0xaa", &confirmation(10)).await.unwrap();
        store.upsert_by_tx_hash("0xaa", &confirmation(10)).await.unwrap();
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "confirmed");
    }

    #[tokio::test]
    async fn completed_records_keep_status_and_api_fields() {
        let store = MemoryDonationStore::new();
        let original =
            store.insert_record("0xbb", DonationStatus::Completed, Some("user-1"), Some("s-1"));
        store.upsert_by_tx_hash("0xbb", &confirmation(12)).await.unwrap();
        let record = store.find("0xbb").unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.donor_id.as_deref(), Some("user-1"));
        assert_eq!(record.target_school_id.as_deref(), Some("s-1"));
        assert_eq!(record.created_at, original.created_at);
        assert_eq!(record.confirmed_at, original.confirmed_at);
        assert_eq!(record.block_number, Some(12));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryDonationStore::new();
        store.fail_times("0xcc", 1);
        assert!(store.upsert_by_tx_hash("0xcc", &confirmation(1)).await.is_err());
        assert!(store.upsert_by_tx_hash("0xcc", &confirmation(1)).await.is_ok());
        assert_eq!(store.writes(), 1);
    }
}

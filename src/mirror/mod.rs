//! Background task that copies `DonationReceived` events from the chain into
//! the donation store.
//!
//! Each iteration fetches every event from `last_block + 1` up to the head,
//! upserts them in chain order and only then moves the cursor. A failed
//! iteration leaves the cursor untouched so the whole batch is replayed; the
//! upsert is idempotent, so replays are harmless.
//!
//! Logs that cannot be decoded, and events whose values do not fit the
//! schema, are skipped at once and the cursor moves past them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, ChainLog, ChainSource, DONATION_RECEIVED, DonationEvent};
use crate::config::MirrorConfig;
use crate::state::ApiCache;
use crate::store::{ChainConfirmation, DonationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("failed to fetch DonationReceived events from block {from_block}: {source}")]
    Chain {
        from_block: u64,
        #[source]
        source: ChainError,
    },
    #[error("failed to store donation {tx_hash} from block {block_number}: {source}")]
    Event {
        tx_hash: String,
        block_number: u64,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub events_seen: usize,
    pub records_written: usize,
    pub quarantined_skipped: usize,
    pub undecodable_skipped: usize,
    pub cursor: u64,
}

pub struct EventMirror {
    chain: Arc<dyn ChainSource>,
    store: Arc<dyn DonationStore>,
    config: MirrorConfig,
    last_block: u64,
    cursor: Arc<AtomicU64>,
    attempts: HashMap<String, u32>,
    quarantined: HashSet<String>,
    cache: Option<Arc<ApiCache>>,
}

impl EventMirror {
    /// Anchors the cursor at the current chain height. Donations emitted
    /// before this point are not replayed.
    pub async fn start(
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn DonationStore>,
        config: MirrorConfig,
        cursor: Arc<AtomicU64>,
    ) -> Result<Self, ChainError> {
        let head = chain.current_block_number().await?;
        cursor.store(head, AtomicOrdering::SeqCst);
        info!("Event mirror anchored at block {head}");
        Ok(Self {
            chain,
            store,
            config,
            last_block: head,
            cursor,
            attempts: HashMap::new(),
            quarantined: HashSet::new(),
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<ApiCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    pub fn is_quarantined(&self, tx_hash: &str) -> bool {
        self.quarantined.contains(tx_hash)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting event mirror loop (poll every {:?})",
            self.config.poll_interval()
        );
        loop {
            if *shutdown.borrow() {
                info!("Event mirror shutdown signal received");
                break;
            }
            self.tick().await;

            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Event mirror shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting event mirror loop");
                            break;
                        }
                    }
                }
                _ = sleep(self.config.poll_interval()) => {}
            }
        }
        info!("Event mirror stopped at block {}", self.last_block());
    }

    /// One iteration with failures absorbed: errors are logged and the next
    /// interval retries from the same cursor.
    pub async fn tick(&mut self) -> Option<IterationReport> {
        match self.run_iteration().await {
            Ok(report) => {
                self.attempts.clear();
                if report.records_written > 0 {
                    debug!(
                        "Mirrored {} of {} donation event(s), cursor at block {}",
                        report.records_written, report.events_seen, report.cursor
                    );
                }
                Some(report)
            }
            Err(err) => {
                error!("Event mirror iteration failed: {err}");
                if let MirrorError::Event { tx_hash, source, .. } = &err {
                    if source.is_permanent() {
                        self.quarantine(tx_hash);
                    } else {
                        self.record_failure(tx_hash);
                    }
                }
                None
            }
        }
    }

    pub async fn run_iteration(&mut self) -> Result<IterationReport, MirrorError> {
        let from_block = self.last_block.saturating_add(1);
        let logs = self
            .chain
            .fetch_events(DONATION_RECEIVED, from_block)
            .await
            .map_err(|source| MirrorError::Chain { from_block, source })?;

        let mut report = IterationReport {
            events_seen: logs.len(),
            ..IterationReport::default()
        };
        let mut candidate = self.last_block;

        for log in &logs {
            let event = match log {
                ChainLog::Donation(event) => event,
                ChainLog::Undecodable(undecodable) => {
                    error!(
                        "Skipping undecodable DonationReceived log (tx {:?}, block {:?}, log {:?}): {}",
                        undecodable.transaction_hash,
                        undecodable.block_number,
                        undecodable.log_index,
                        undecodable.reason
                    );
                    report.undecodable_skipped += 1;
                    candidate = candidate.max(log.block_number().unwrap_or(candidate));
                    continue;
                }
            };

            if self.is_quarantined(&event.transaction_hash) {
                debug!(
                    "Skipping quarantined donation {} at block {}",
                    event.transaction_hash, event.block_number
                );
                report.quarantined_skipped += 1;
                candidate = candidate.max(event.block_number);
                continue;
            }

            self.store_event(event).await?;
            report.records_written += 1;
            candidate = candidate.max(event.block_number);
        }

        self.commit_cursor(candidate);
        report.cursor = self.last_block;

        if report.records_written > 0 {
            if let Some(cache) = &self.cache {
                cache.invalidate_stats();
            }
        }
        Ok(report)
    }

    async fn store_event(&self, event: &DonationEvent) -> Result<(), MirrorError> {
        let timestamp = self.block_timestamp(event.block_number).await;
        let confirmation = ChainConfirmation::from_event(event, timestamp);
        self.store
            .upsert_by_tx_hash(&event.transaction_hash, &confirmation)
            .await
            .map_err(|source| MirrorError::Event {
                tx_hash: event.transaction_hash.clone(),
                block_number: event.block_number,
                source,
            })?;

        info!(
            "Synced donation {} from {}: {} wei for {:?} (block {}, log {:?})",
            event.donation_id,
            event.donor_address,
            event.amount,
            event.purpose,
            event.block_number,
            event.log_index
        );
        Ok(())
    }

    async fn block_timestamp(&self, block_number: u64) -> i64 {
        match self.chain.block_timestamp(block_number).await {
            Ok(timestamp) => timestamp,
            Err(err) => {
                let now = Utc::now().timestamp();
                warn!(
                    "Timestamp lookup for block {block_number} failed, using wall clock {now}: {err}"
                );
                now
            }
        }
    }

    fn commit_cursor(&mut self, candidate: u64) {
        if candidate > self.last_block {
            self.last_block = candidate;
            self.cursor.store(candidate, AtomicOrdering::SeqCst);
        }
    }

    fn record_failure(&mut self, tx_hash: &str) {
        let Some(max_attempts) = self.config.max_event_attempts else {
            return;
        };
        let attempts = self.attempts.entry(tx_hash.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts >= max_attempts {
            error!("Donation {tx_hash} failed {attempts} times");
            self.quarantine(tx_hash);
        }
    }

    fn quarantine(&mut self, tx_hash: &str) {
        error!("Quarantining donation {tx_hash}; it will be skipped until restart");
        self.attempts.remove(tx_hash);
        self.quarantined.insert(tx_hash.to_string());
    }
}

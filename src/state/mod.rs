use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::config::CacheConfig;
use crate::models::donation::{DonationStatsResponse, LeaderboardResponse, MonthlyStatsResponse};
use crate::rpc::RpcChainClient;
use crate::store::PgDonationStore;

/// Whether the event mirror is running, and why not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSyncMode {
    Active,
    Disabled(String),
}

impl ChainSyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled(_) => "api_only",
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub donations: PgDonationStore,
    pub cache: Arc<ApiCache>,
    pub chain: Option<RpcChainClient>,
    pub chain_sync: ChainSyncMode,
    pub start_time: Instant,
    pub last_processed_block: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        database: DatabaseConnection,
        cache: Arc<ApiCache>,
        chain: Option<RpcChainClient>,
        chain_sync: ChainSyncMode,
        last_processed_block: Arc<AtomicU64>,
    ) -> Self {
        assert!(
            chain.is_some() || chain_sync != ChainSyncMode::Active,
            "Active chain sync requires a chain client"
        );
        Self {
            donations: PgDonationStore::new(database.clone()),
            database,
            cache,
            chain,
            chain_sync,
            start_time: Instant::now(),
            last_processed_block,
        }
    }
}

pub struct ApiCache {
    pub stats: Cache<String, Arc<DonationStatsResponse>>,
    pub monthly: Cache<String, Arc<MonthlyStatsResponse>>,
    pub leaderboards: Cache<String, Arc<LeaderboardResponse>>,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.stats_max_capacity >= 1,
            "Stats cache capacity threshold"
        );

        let stats = Cache::builder()
            .max_capacity(config.stats_max_capacity)
            .time_to_live(Duration::from_secs(config.stats_ttl_seconds))
            .build();

        let monthly = Cache::builder()
            .max_capacity(config.stats_max_capacity)
            .time_to_live(Duration::from_secs(config.stats_ttl_seconds))
            .build();

        let leaderboards = Cache::builder()
            .max_capacity(config.stats_max_capacity)
            .time_to_live(Duration::from_secs(config.stats_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.stats_ttl_seconds / 2 + 1))
            .build();

        Self {
            stats,
            monthly,
            leaderboards,
        }
    }

    /// Drops every aggregate; called after any write that changes totals.
    pub fn invalidate_stats(&self) {
        self.stats.invalidate_all();
        self.monthly.invalidate_all();
        self.leaderboards.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            stats_max_capacity: 8,
            stats_ttl_seconds: 30,
        }
    }

    #[tokio::test]
    async fn invalidation_clears_aggregates() {
        let cache = ApiCache::new(&config());
        cache
            .stats
            .insert(
                "total".to_string(),
                Arc::new(DonationStatsResponse {
                    total_wei: "1".to_string(),
                    total_eth: "0.000000000000000001".to_string(),
                    total_donations: 1,
                    schools_helped: 0,
                }),
            )
            .await;
        cache
            .monthly
            .insert(
                "trailing-year".to_string(),
                Arc::new(MonthlyStatsResponse { months: Vec::new() }),
            )
            .await;
        assert!(cache.stats.get("total").await.is_some());

        cache.invalidate_stats();
        assert!(cache.stats.get("total").await.is_none());
        assert!(cache.monthly.get("trailing-year").await.is_none());
    }

    #[test]
    fn sync_mode_labels() {
        assert_eq!(ChainSyncMode::Active.label(), "active");
        assert_eq!(
            ChainSyncMode::Disabled("missing RPC URL".to_string()).label(),
            "api_only"
        );
    }
}

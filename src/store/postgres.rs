use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::Insert;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use sea_orm::QuerySelect;
use sea_orm::Select;
use sea_orm::sea_query::{Expr, OnConflict};
use tracing::debug;

use super::{
    ChainConfirmation, DonationFilter, DonationStore, DonationTotals, DonorRank,
    MAX_LIST_LIMIT, MONTHLY_WINDOW_DAYS, MonthlyTotal, NewPendingDonation, StoreError,
    to_decimal, to_i64,
};
use crate::donation::DonationStatus;
use crate::entities::donation;

/// Moves `pending` to `confirmed` and leaves every later status alone.
const PROMOTE_PENDING_SQL: &str = "CASE WHEN \"donations\".\"status\" = 'pending' \
     THEN 'confirmed' ELSE \"donations\".\"status\" END";
const KEEP_FIRST_CONFIRMATION_SQL: &str =
    "COALESCE(\"donations\".\"confirmed_at\", \"excluded\".\"confirmed_at\")";
const MONTH_BUCKET_SQL: &str = "date_trunc('month', \"donations\".\"created_at\" AT TIME ZONE 'UTC')";

#[derive(Clone)]
pub struct PgDonationStore {
    database: DatabaseConnection,
}

impl PgDonationStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }

    /// Registers a donation intent. When the transaction hash is already
    /// known (typically because the mirror saw it first) only the
    /// API-owned fields that are still empty are filled in.
    pub async fn create_pending(
        &self,
        request: NewPendingDonation,
    ) -> Result<donation::Model, StoreError> {
        let tx_hash = request.transaction_hash.clone();
        let model = pending_model(request, fixed_now())?;
        let Some(tx_hash) = tx_hash else {
            return Ok(model.insert(&self.database).await?);
        };

        pending_insert(model)
            .exec_without_returning(&self.database)
            .await?;

        self.find_by_tx_hash(&tx_hash)
            .await?
            .ok_or(StoreError::NotFound(tx_hash))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<donation::Model>, StoreError> {
        Ok(donation::Entity::find_by_id(id).one(&self.database).await?)
    }

    pub async fn find_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<donation::Model>, StoreError> {
        Ok(donation::Entity::find()
            .filter(donation::Column::TransactionHash.eq(tx_hash))
            .one(&self.database)
            .await?)
    }

    /// Newest first.
    pub async fn list(&self, filter: &DonationFilter) -> Result<Vec<donation::Model>, StoreError> {
        assert!(filter.limit <= MAX_LIST_LIMIT, "List limit exceeds bound");
        let mut select = donation::Entity::find();
        if let Some(status) = filter.status {
            select = select.filter(donation::Column::Status.eq(status.as_str()));
        }
        if let Some(address) = &filter.donor_address {
            select = select.filter(donation::Column::DonorAddress.eq(address.as_str()));
        }
        if let Some(donor_id) = &filter.donor_id {
            select = select.filter(donation::Column::DonorId.eq(donor_id.as_str()));
        }
        if let Some(school) = &filter.target_school_id {
            select = select.filter(donation::Column::TargetSchoolId.eq(school.as_str()));
        }

        Ok(select
            .order_by_desc(donation::Column::CreatedAt)
            .order_by_desc(donation::Column::Id)
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.database)
            .await?)
    }

    /// Moves a record exactly one step along the lifecycle. The status check
    /// and the write happen in one conditional statement so concurrent
    /// administrators cannot both succeed.
    pub async fn advance_status(
        &self,
        id: i64,
        next: DonationStatus,
        target_school_id: Option<String>,
    ) -> Result<donation::Model, StoreError> {
        let Some(from) = next.predecessor() else {
            return Err(self.transition_error(id, next).await);
        };

        let now = fixed_now();
        let timestamp_column = match next {
            DonationStatus::Allocated => donation::Column::AllocatedAt,
            DonationStatus::Completed => donation::Column::CompletedAt,
            _ => donation::Column::ConfirmedAt,
        };

        let mut update = donation::Entity::update_many()
            .col_expr(donation::Column::Status, Expr::value(next.as_str()))
            .col_expr(timestamp_column, Expr::value(now))
            .filter(donation::Column::Id.eq(id))
            .filter(donation::Column::Status.eq(from.as_str()));
        if let Some(school) = target_school_id {
            update = update.col_expr(donation::Column::TargetSchoolId, Expr::value(school));
        }

        let result = update.exec(&self.database).await?;
        if result.rows_affected == 0 {
            return Err(self.transition_error(id, next).await);
        }
        debug!("Donation {id} moved from {from} to {next}");

        self.find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn transition_error(&self, id: i64, requested: DonationStatus) -> StoreError {
        match self.find_by_id(id).await {
            Ok(Some(existing)) => StoreError::InvalidTransition {
                id,
                current: existing.status,
                requested,
            },
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(err) => err,
        }
    }

    /// Aggregates over donations that reached the chain.
    pub async fn totals(&self) -> Result<DonationTotals, StoreError> {
        let (total_amount, total_donations, schools_helped) = donation::Entity::find()
            .select_only()
            .column_as(donation::Column::Amount.sum(), "total_amount")
            .column_as(donation::Column::Id.count(), "total_donations")
            .column_as(
                Expr::cust("COUNT(DISTINCT \"donations\".\"target_school_id\")"),
                "schools_helped",
            )
            .filter(donation::Column::Status.is_in(settled_statuses()))
            .into_tuple::<(Option<Decimal>, i64, i64)>()
            .one(&self.database)
            .await?
            .unwrap_or((None, 0, 0));

        Ok(DonationTotals {
            total_amount: total_amount.unwrap_or(Decimal::ZERO),
            total_donations: total_donations.max(0) as u64,
            schools_helped: schools_helped.max(0) as u64,
        })
    }

    /// Settled donations of the trailing year, bucketed by UTC calendar
    /// month, oldest first.
    pub async fn monthly_totals(&self) -> Result<Vec<MonthlyTotal>, StoreError> {
        let since = fixed_now() - Duration::days(MONTHLY_WINDOW_DAYS);
        let rows = monthly_totals_query(since)
            .into_tuple::<(NaiveDateTime, Option<Decimal>, i64)>()
            .all(&self.database)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(month, total_amount, donation_count)| MonthlyTotal {
                year: month.year(),
                month: month.month(),
                total_amount: total_amount.unwrap_or(Decimal::ZERO),
                donation_count: donation_count.max(0) as u64,
            })
            .collect())
    }

    pub async fn leaderboard(&self, limit: u64) -> Result<Vec<DonorRank>, StoreError> {
        assert!(limit <= MAX_LIST_LIMIT, "Leaderboard limit exceeds bound");
        let rows = donation::Entity::find()
            .select_only()
            .column(donation::Column::DonorAddress)
            .column_as(donation::Column::Amount.sum(), "total_amount")
            .column_as(donation::Column::Id.count(), "donation_count")
            .filter(donation::Column::Status.is_in(settled_statuses()))
            .filter(donation::Column::DonorAddress.is_not_null())
            .group_by(donation::Column::DonorAddress)
            .order_by_desc(Expr::cust("\"total_amount\""))
            .order_by_asc(donation::Column::DonorAddress)
            .limit(limit)
            .into_tuple::<(String, Option<Decimal>, i64)>()
            .all(&self.database)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(donor_address, total_amount, donation_count)| DonorRank {
                donor_address,
                total_amount: total_amount.unwrap_or(Decimal::ZERO),
                donation_count: donation_count.max(0) as u64,
            })
            .collect())
    }
}

#[async_trait]
impl DonationStore for PgDonationStore {
    async fn upsert_by_tx_hash(
        &self,
        tx_hash: &str,
        confirmation: &ChainConfirmation,
    ) -> Result<(), StoreError> {
        confirmation_insert(tx_hash, confirmation, fixed_now())?
            .exec_without_returning(&self.database)
            .await?;
        Ok(())
    }
}

fn pending_model(
    request: NewPendingDonation,
    now: DateTime<FixedOffset>,
) -> Result<donation::ActiveModel, StoreError> {
    Ok(donation::ActiveModel {
        transaction_hash: Set(request.transaction_hash),
        donor_address: Set(request.donor_address),
        donor_id: Set(request.donor_id),
        amount: Set(to_decimal(request.amount)?),
        purpose: Set(request.purpose),
        target_school_id: Set(request.target_school_id),
        status: Set(DonationStatus::Pending.as_str().to_string()),
        created_at: Set(now),
        ..Default::default()
    })
}

/// On a known hash only the API-owned fields that are still empty change.
fn pending_insert(model: donation::ActiveModel) -> Insert<donation::ActiveModel> {
    let on_conflict = OnConflict::column(donation::Column::TransactionHash)
        .value(donation::Column::DonorId, keep_existing("donor_id"))
        .value(
            donation::Column::TargetSchoolId,
            keep_existing("target_school_id"),
        )
        .value(donation::Column::DonorAddress, keep_existing("donor_address"))
        .to_owned();
    donation::Entity::insert(model).on_conflict(on_conflict)
}

/// Chain-owned fields are overwritten; donor id, target school and
/// `created_at` are never part of the update.
fn confirmation_insert(
    tx_hash: &str,
    confirmation: &ChainConfirmation,
    now: DateTime<FixedOffset>,
) -> Result<Insert<donation::ActiveModel>, StoreError> {
    let model = donation::ActiveModel {
        transaction_hash: Set(Some(tx_hash.to_string())),
        donor_address: Set(Some(confirmation.donor_address.clone())),
        donation_id: Set(Some(to_i64(confirmation.donation_id, "donation_id")?)),
        amount: Set(to_decimal(confirmation.amount)?),
        purpose: Set(confirmation.purpose.clone()),
        block_number: Set(Some(to_i64(confirmation.block_number, "block_number")?)),
        block_timestamp: Set(Some(confirmation.block_timestamp)),
        status: Set(DonationStatus::Confirmed.as_str().to_string()),
        created_at: Set(now),
        confirmed_at: Set(Some(now)),
        ..Default::default()
    };

    let on_conflict = OnConflict::column(donation::Column::TransactionHash)
        .update_columns([
            donation::Column::DonorAddress,
            donation::Column::DonationId,
            donation::Column::Amount,
            donation::Column::Purpose,
            donation::Column::BlockNumber,
            donation::Column::BlockTimestamp,
        ])
        .value(donation::Column::Status, Expr::cust(PROMOTE_PENDING_SQL))
        .value(
            donation::Column::ConfirmedAt,
            Expr::cust(KEEP_FIRST_CONFIRMATION_SQL),
        )
        .to_owned();

    Ok(donation::Entity::insert(model).on_conflict(on_conflict))
}

fn monthly_totals_query(since: DateTime<FixedOffset>) -> Select<donation::Entity> {
    donation::Entity::find()
        .select_only()
        .column_as(Expr::cust(MONTH_BUCKET_SQL), "month")
        .column_as(donation::Column::Amount.sum(), "total_amount")
        .column_as(donation::Column::Id.count(), "donation_count")
        .filter(donation::Column::Status.is_in(settled_statuses()))
        .filter(donation::Column::CreatedAt.gte(since))
        .group_by(Expr::cust(MONTH_BUCKET_SQL))
        .order_by_asc(Expr::cust(MONTH_BUCKET_SQL))
}

fn keep_existing(column: &str) -> sea_orm::sea_query::SimpleExpr {
    Expr::cust(format!(
        "COALESCE(\"donations\".\"{column}\", \"excluded\".\"{column}\")"
    ))
}

fn settled_statuses() -> Vec<&'static str> {
    DonationStatus::settled()
        .iter()
        .map(|status| status.as_str())
        .collect()
}

fn fixed_now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

#[cfg(test)]
mod tests {
    use sea_orm::{DbBackend, QueryTrait};

    use super::*;

    fn confirmation() -> ChainConfirmation {
        ChainConfirmation {
            donor_address: "0x1111111111111111111111111111111111111111".to_string(),
            donation_id: 7,
            amount: 5_000_000_000_000_000,
            purpose: "books".to_string(),
            block_number: 1000,
            block_timestamp: 1_700_000_000,
        }
    }

    /// The `DO UPDATE SET` list of a rendered upsert.
    fn update_list(sql: &str) -> &str {
        let (_, tail) = sql
            .split_once("ON CONFLICT (\"transaction_hash\") DO UPDATE SET ")
            .expect("conflict target is the transaction hash");
        tail.split(" RETURNING ").next().unwrap_or(tail)
    }

    #[test]
    fn confirmation_upsert_merges_chain_fields_only() {
        let tx_hash = format!("0x{}", "ab".repeat(32));
        let sql = confirmation_insert(&tx_hash, &confirmation(), fixed_now())
            .unwrap()
            .build(DbBackend::Postgres)
            .to_string();
        assert!(sql.starts_with("INSERT INTO \"donations\""));
        assert!(sql.contains(&tx_hash));
        assert!(sql.contains("'confirmed'"));

        let updates = update_list(&sql);
        for column in [
            "donor_address",
            "donation_id",
            "amount",
            "purpose",
            "block_number",
            "block_timestamp",
        ] {
            let assignment = format!("\"{column}\" = \"excluded\".\"{column}\"");
            assert!(updates.contains(&assignment), "missing {assignment} in {updates}");
        }
        assert!(updates.contains(&format!("\"status\" = {PROMOTE_PENDING_SQL}")));
        assert!(updates.contains(&format!("\"confirmed_at\" = {KEEP_FIRST_CONFIRMATION_SQL}")));
        for preserved in ["\"donor_id\"", "\"target_school_id\"", "\"created_at\""] {
            assert!(!updates.contains(preserved), "{preserved} is overwritten: {updates}");
        }
    }

    #[test]
    fn confirmation_upsert_rejects_unstorable_values() {
        let mut oversized = confirmation();
        oversized.block_number = u64::MAX;
        assert!(matches!(
            confirmation_insert("0xaa", &oversized, fixed_now()),
            Err(StoreError::Overflow { field: "block_number", .. })
        ));
    }

    #[test]
    fn pending_upsert_only_fills_empty_api_fields() {
        let request = NewPendingDonation {
            amount: 5_000_000_000_000_000,
            purpose: "books".to_string(),
            transaction_hash: Some(format!("0x{}", "cd".repeat(32))),
            donor_address: None,
            donor_id: Some("user-42".to_string()),
            target_school_id: Some("school-3".to_string()),
        };
        let model = pending_model(request, fixed_now()).unwrap();
        let sql = pending_insert(model).build(DbBackend::Postgres).to_string();
        assert!(sql.contains("'pending'"));

        let updates = update_list(&sql);
        for column in ["donor_id", "target_school_id", "donor_address"] {
            let assignment = format!(
                "\"{column}\" = COALESCE(\"donations\".\"{column}\", \"excluded\".\"{column}\")"
            );
            assert!(updates.contains(&assignment), "missing {assignment} in {updates}");
        }
        for untouched in ["\"status\"", "\"amount\"", "\"purpose\"", "\"created_at\"", "\"confirmed_at\""] {
            assert!(!updates.contains(untouched), "{untouched} is overwritten: {updates}");
        }
    }

    #[test]
    fn monthly_totals_group_settled_donations_by_month() {
        let since = fixed_now() - Duration::days(MONTHLY_WINDOW_DAYS);
        let sql = monthly_totals_query(since)
            .build(DbBackend::Postgres)
            .to_string();
        assert!(sql.contains(&format!("GROUP BY {MONTH_BUCKET_SQL}")));
        assert!(sql.contains(&format!("ORDER BY {MONTH_BUCKET_SQL} ASC")));
        assert!(sql.contains("'confirmed', 'allocated', 'completed'"));
        assert!(sql.contains("\"donations\".\"created_at\" >="));
    }

    #[test]
    fn settled_statuses_exclude_pending() {
        let statuses = settled_statuses();
        assert_eq!(statuses, vec!["confirmed", "allocated", "completed"]);
    }
}

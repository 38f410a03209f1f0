use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::donation::{
    DonationStatus, canonicalize_purpose, canonicalize_reference_id, normalize_address,
    normalize_tx_hash, parse_donation_amount,
};
use crate::models::donation::{
    AllocateDonationRequest, CreateDonationRequest, DonationListQuery, DonationListResponse,
    DonationStatsResponse, DonationView, LeaderboardResponse, MonthlyStatsResponse,
};
use crate::state::AppState;
use crate::store::{DEFAULT_LIST_LIMIT, DonationFilter, MAX_LIST_LIMIT, NewPendingDonation};

use super::HttpError;

const STATS_CACHE_KEY: &str = "total";
const MONTHLY_CACHE_KEY: &str = "trailing-year";
const DEFAULT_LEADERBOARD_SIZE: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/donations", get(list_donations).post(create_donation))
        .route("/donations/stats/total", get(donation_stats))
        .route("/donations/stats/monthly", get(monthly_stats))
        .route("/donations/leaderboard", get(donor_leaderboard))
        .route("/donations/tx/{tx_hash}", get(get_by_transaction))
        .route("/donations/donor/{address}", get(list_by_donor))
        .route("/donations/schools/{school_id}", get(list_by_school))
        .route("/donations/{id}", get(get_donation))
        .route("/donations/{id}/confirm", post(confirm_donation))
        .route("/donations/{id}/allocate", post(allocate_donation))
        .route("/donations/{id}/complete", post(complete_donation))
}

async fn list_donations(
    State(state): State<AppState>,
    Query(query): Query<DonationListQuery>,
) -> Result<Json<DonationListResponse>, HttpError> {
    let filter = donation_filter(query)?;
    list_with(&state, filter).await
}

async fn list_by_donor(
    Path(address): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<DonationListQuery>,
) -> Result<Json<DonationListResponse>, HttpError> {
    let filter = donation_filter(DonationListQuery {
        donor_address: Some(address),
        ..query
    })?;
    list_with(&state, filter).await
}

async fn list_by_school(
    Path(school_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<DonationListQuery>,
) -> Result<Json<DonationListResponse>, HttpError> {
    let filter = donation_filter(DonationListQuery {
        target_school_id: Some(school_id),
        ..query
    })?;
    list_with(&state, filter).await
}

async fn list_with(
    state: &AppState,
    filter: DonationFilter,
) -> Result<Json<DonationListResponse>, HttpError> {
    let records = state.donations.list(&filter).await?;
    Ok(Json(DonationListResponse {
        donations: records.into_iter().map(DonationView::from).collect(),
        limit: filter.limit,
        offset: filter.offset,
    }))
}

async fn create_donation(
    State(state): State<AppState>,
    Json(payload): Json<CreateDonationRequest>,
) -> Result<(StatusCode, Json<DonationView>), HttpError> {
    let request = pending_donation(payload)?;
    let record = state.donations.create_pending(request).await?;
    info!(
        "Registered donation {} ({} wei, status {})",
        record.id, record.amount, record.status
    );
    state.cache.invalidate_stats();
    Ok((StatusCode::CREATED, Json(DonationView::from(record))))
}

async fn get_donation(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<DonationView>, HttpError> {
    let record = state.donations.find_by_id(id).await?.ok_or_else(|| {
        HttpError::new(StatusCode::NOT_FOUND, format!("Donation {id} not found"))
    })?;
    Ok(Json(DonationView::from(record)))
}

async fn get_by_transaction(
    Path(tx_hash): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DonationView>, HttpError> {
    let canonical = parse_tx_hash(&tx_hash)?;
    let record = state
        .donations
        .find_by_tx_hash(&canonical)
        .await?
        .ok_or_else(|| {
            HttpError::new(
                StatusCode::NOT_FOUND,
                format!("No donation recorded for transaction {canonical}"),
            )
        })?;
    Ok(Json(DonationView::from(record)))
}

async fn confirm_donation(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<DonationView>, HttpError> {
    advance(&state, id, DonationStatus::Confirmed, None).await
}

async fn allocate_donation(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<AllocateDonationRequest>,
) -> Result<Json<DonationView>, HttpError> {
    let school_id = canonicalize_reference_id(&payload.school_id, "School id")
        .map_err(HttpError::bad_request)?
        .ok_or_else(|| HttpError::bad_request("School id is required for allocation"))?;
    advance(&state, id, DonationStatus::Allocated, Some(school_id)).await
}

async fn complete_donation(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<DonationView>, HttpError> {
    advance(&state, id, DonationStatus::Completed, None).await
}

async fn advance(
    state: &AppState,
    id: i64,
    next: DonationStatus,
    target_school_id: Option<String>,
) -> Result<Json<DonationView>, HttpError> {
    let record = state
        .donations
        .advance_status(id, next, target_school_id)
        .await?;
    info!("Donation {id} is now {next}");
    state.cache.invalidate_stats();
    Ok(Json(DonationView::from(record)))
}

async fn donation_stats(
    State(state): State<AppState>,
) -> Result<Json<DonationStatsResponse>, HttpError> {
    if let Some(cached) = state.cache.stats.get(STATS_CACHE_KEY).await {
        return Ok(Json((*cached).clone()));
    }

    let response = DonationStatsResponse::from(state.donations.totals().await?);
    state
        .cache
        .stats
        .insert(STATS_CACHE_KEY.to_string(), Arc::new(response.clone()))
        .await;
    Ok(Json(response))
}

async fn monthly_stats(
    State(state): State<AppState>,
) -> Result<Json<MonthlyStatsResponse>, HttpError> {
    if let Some(cached) = state.cache.monthly.get(MONTHLY_CACHE_KEY).await {
        return Ok(Json((*cached).clone()));
    }

    let response = MonthlyStatsResponse::from(state.donations.monthly_totals().await?);
    state
        .cache
        .monthly
        .insert(MONTHLY_CACHE_KEY.to_string(), Arc::new(response.clone()))
        .await;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
struct LeaderboardQuery {
    limit: Option<u64>,
}

async fn donor_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, HttpError> {
    let limit = bounded_limit(query.limit, DEFAULT_LEADERBOARD_SIZE)?;
    let cache_key = format!("top:{limit}");
    if let Some(cached) = state.cache.leaderboards.get(&cache_key).await {
        return Ok(Json((*cached).clone()));
    }

    let response = LeaderboardResponse::from(state.donations.leaderboard(limit).await?);
    state
        .cache
        .leaderboards
        .insert(cache_key, Arc::new(response.clone()))
        .await;
    Ok(Json(response))
}

fn pending_donation(payload: CreateDonationRequest) -> Result<NewPendingDonation, HttpError> {
    let amount = parse_donation_amount(&payload.amount).map_err(HttpError::bad_request)?;
    let purpose = canonicalize_purpose(&payload.purpose).map_err(HttpError::bad_request)?;
    let transaction_hash = payload
        .transaction_hash
        .as_deref()
        .map(str::trim)
        .filter(|hash| !hash.is_empty())
        .map(parse_tx_hash)
        .transpose()?;
    let donor_address = payload
        .donor_address
        .as_deref()
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(parse_donor_address)
        .transpose()?;
    let donor_id = optional_reference(payload.donor_id.as_deref(), "Donor id")?;
    let target_school_id =
        optional_reference(payload.target_school_id.as_deref(), "Target school id")?;

    Ok(NewPendingDonation {
        amount,
        purpose,
        transaction_hash,
        donor_address,
        donor_id,
        target_school_id,
    })
}

fn donation_filter(query: DonationListQuery) -> Result<DonationFilter, HttpError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DonationStatus>)
        .transpose()
        .map_err(HttpError::bad_request)?;
    let donor_address = query.donor_address.as_deref().map(parse_donor_address).transpose()?;
    let donor_id = optional_reference(query.donor_id.as_deref(), "Donor id")?;
    let target_school_id =
        optional_reference(query.target_school_id.as_deref(), "Target school id")?;

    Ok(DonationFilter {
        status,
        donor_address,
        donor_id,
        target_school_id,
        limit: bounded_limit(query.limit, DEFAULT_LIST_LIMIT)?,
        offset: query.offset.unwrap_or(0),
    })
}

fn bounded_limit(limit: Option<u64>, default: u64) -> Result<u64, HttpError> {
    match limit {
        None => Ok(default),
        Some(0) => Err(HttpError::bad_request("Limit must be positive")),
        Some(limit) => Ok(limit.min(MAX_LIST_LIMIT)),
    }
}

fn parse_tx_hash(value: &str) -> Result<String, HttpError> {
    let trimmed = value.trim();
    if !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
        return Err(HttpError::bad_request(
            "Invalid transaction hash format: expected 0x followed by 64 hex characters",
        ));
    }
    normalize_tx_hash(trimmed).map_err(HttpError::bad_request)
}

fn parse_donor_address(value: &str) -> Result<String, HttpError> {
    let trimmed = value.trim();
    if !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
        return Err(HttpError::bad_request(
            "Invalid donor address: expected 0x followed by 40 hex characters",
        ));
    }
    normalize_address(trimmed).map_err(HttpError::bad_request)
}

fn optional_reference(value: Option<&str>, label: &str) -> Result<Option<String>, HttpError> {
    match value {
        Some(value) => canonicalize_reference_id(value, label).map_err(HttpError::bad_request),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;

    use rust_decimal::Decimal;

    use super::*;
    use crate::http::tests::{offline_app, offline_app_with_cache, send};
    use crate::store::MonthlyTotal;

    fn payload(amount: &str, tx_hash: Option<&str>) -> CreateDonationRequest {
        CreateDonationRequest {
            amount: amount.to_string(),
            purpose: "  Raspberry Pi kits ".to_string(),
            transaction_hash: tx_hash.map(str::to_string),
            donor_address: Some("0x1111111111111111111111111111111111111111".to_string()),
            donor_id: Some("user-42".to_string()),
            target_school_id: Some("".to_string()),
        }
    }

    #[test]
    fn pending_donation_is_canonicalized() {
        let hash = format!("0x{}", "AB".repeat(32));
        let request =
            pending_donation(payload("5000000000000000", Some(&hash))).expect("valid payload");
        assert_eq!(request.amount, 5_000_000_000_000_000);
        assert_eq!(request.purpose, "Raspberry Pi kits");
        assert_eq!(
            request.transaction_hash,
            Some(format!("0x{}", "ab".repeat(32)))
        );
        assert_eq!(request.donor_id.as_deref(), Some("user-42"));
        assert_eq!(request.target_school_id, None);
    }

    #[test]
    fn pending_donation_rejects_bad_input() {
        assert!(pending_donation(payload("10", None)).is_err());
        assert!(pending_donation(payload("5000000000000000", Some("0x1234"))).is_err());
        let unprefixed = "ab".repeat(32);
        assert!(pending_donation(payload("5000000000000000", Some(&unprefixed))).is_err());

        let mut bad_address = payload("5000000000000000", None);
        bad_address.donor_address = Some("not-an-address".to_string());
        assert!(pending_donation(bad_address).is_err());
    }

    #[test]
    fn list_filter_defaults_and_bounds() {
        let filter = donation_filter(DonationListQuery::default()).unwrap();
        assert_eq!(filter.limit, DEFAULT_LIST_LIMIT);
        assert_eq!(filter.offset, 0);

        let filter = donation_filter(DonationListQuery {
            status: Some("Allocated".to_string()),
            limit: Some(1_000),
            ..DonationListQuery::default()
        })
        .unwrap();
        assert_eq!(filter.status, Some(DonationStatus::Allocated));
        assert_eq!(filter.limit, MAX_LIST_LIMIT);

        assert!(
            donation_filter(DonationListQuery {
                status: Some("refunded".to_string()),
                ..DonationListQuery::default()
            })
            .is_err()
        );
        assert!(
            donation_filter(DonationListQuery {
                limit: Some(0),
                ..DonationListQuery::default()
            })
            .is_err()
        );
    }

    #[tokio::test]
    async fn create_rejects_amount_below_minimum() {
        let request = Request::post("/donations")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"amount":"1","purpose":"books"}"#))
            .unwrap();
        let (status, body) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("minimum"));
    }

    #[tokio::test]
    async fn malformed_transaction_hash_is_rejected_before_lookup() {
        let request = Request::get("/donations/tx/0x1234")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn allocation_requires_school() {
        let request = Request::post("/donations/7/allocate")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"school_id":"   "}"#))
            .unwrap();
        let (status, body) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("School id"));
    }

    #[tokio::test]
    async fn monthly_stats_are_served_from_cache() {
        let (app, cache) = offline_app_with_cache();
        cache
            .monthly
            .insert(
                MONTHLY_CACHE_KEY.to_string(),
                Arc::new(MonthlyStatsResponse::from(vec![MonthlyTotal {
                    year: 2026,
                    month: 3,
                    total_amount: Decimal::from(2_000_000_000_000_000_000u64),
                    donation_count: 2,
                }])),
            )
            .await;

        let request = Request::get("/donations/stats/monthly")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["months"][0]["year"], 2026);
        assert_eq!(body["months"][0]["month"], 3);
        assert_eq!(body["months"][0]["total_eth"], "2");
    }

    #[tokio::test]
    async fn monthly_stats_miss_queries_database() {
        let request = Request::get("/donations/stats/monthly")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn database_failures_surface_as_server_errors() {
        let request = Request::get("/donations/7").body(Body::empty()).unwrap();
        let (status, body) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }
}

use std::future::Future;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppState, ChainSyncMode};
use crate::store::StoreError;

mod donations;

/// Upper bound on the chain reachability check of `/health/ready`.
const READINESS_CHAIN_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    assert!(
        state.start_time.elapsed() < Duration::from_secs(86_400),
        "Application uptime exceeds 24 hours before router creation"
    );

    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .merge(donations::router())
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin when none are configured.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Ignoring invalid CORS origin {origin:?}: {err}");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let last_block = state.last_processed_block.load(AtomicOrdering::SeqCst);
    assert!(
        last_block <= i64::MAX as u64,
        "Last processed block exceeds bounds"
    );

    let (chain_reachable, rpc_timeout_ms) = match &state.chain {
        Some(chain) => (
            Some(within_deadline(chain.is_connected(), READINESS_CHAIN_CHECK_TIMEOUT).await),
            Some(u64::try_from(chain.timeout().as_millis()).unwrap_or(u64::MAX)),
        ),
        None => (None, None),
    };

    let disabled_reason = match &state.chain_sync {
        ChainSyncMode::Disabled(reason) => Some(reason.clone()),
        ChainSyncMode::Active => None,
    };

    let response = ReadyResponse {
        status: "ready",
        chain_sync: state.chain_sync.label(),
        chain_sync_disabled_reason: disabled_reason,
        chain_reachable,
        last_processed_block: last_block,
        rpc_timeout_ms,
        cache_entries: CacheSummary {
            stats: state.cache.stats.entry_count(),
            monthly: state.cache.monthly.entry_count(),
            leaderboards: state.cache.leaderboards.entry_count(),
        },
    };
    Ok(Json(response))
}

/// A reachability check that does not answer in time counts as unreachable.
async fn within_deadline(check: impl Future<Output = bool>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, check).await {
        Ok(reachable) => reachable,
        Err(_) => {
            warn!("Chain reachability check timed out after {limit:?}");
            false
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    chain_sync: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_sync_disabled_reason: Option<String>,
    chain_reachable: Option<bool>,
    last_processed_block: u64,
    rpc_timeout_ms: Option<u64>,
    cache_entries: CacheSummary,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    stats: u64,
    monthly: u64,
    leaderboards: u64,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn bad_request(message: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            StoreError::Overflow { .. } => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!("HTTP error {}: {}", self.status().as_u16(), self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use sea_orm::{DatabaseConnection, DbErr};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::CacheConfig;
    use crate::donation::DonationStatus;
    use crate::state::ApiCache;

    pub(crate) fn offline_app() -> Router {
        offline_app_with_origins(&[])
    }

    pub(crate) fn offline_app_with_cache() -> (Router, Arc<ApiCache>) {
        let cache = test_cache();
        (offline_router(cache.clone(), &[]), cache)
    }

    pub(crate) fn offline_app_with_origins(allowed_origins: &[String]) -> Router {
        offline_router(test_cache(), allowed_origins)
    }

    fn test_cache() -> Arc<ApiCache> {
        Arc::new(ApiCache::new(&CacheConfig {
            stats_max_capacity: 8,
            stats_ttl_seconds: 30,
        }))
    }

    fn offline_router(cache: Arc<ApiCache>, allowed_origins: &[String]) -> Router {
        let state = AppState::new(
            DatabaseConnection::Disconnected,
            cache,
            None,
            ChainSyncMode::Disabled("chain sync not configured".to_string()),
            Arc::new(AtomicU64::new(0)),
        );
        router(state, allowed_origins)
    }

    pub(crate) async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("body fits");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn liveness_does_not_touch_database() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "live");
    }

    #[tokio::test]
    async fn readiness_fails_without_database() {
        let request = Request::get("/health/ready").body(Body::empty()).unwrap();
        let (status, body) = send(offline_app(), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn slow_chain_check_reports_unreachable() {
        let stalled = std::future::pending::<bool>();
        assert!(!within_deadline(stalled, Duration::from_millis(20)).await);
        assert!(within_deadline(async { true }, Duration::from_millis(20)).await);
    }

    #[test]
    fn store_errors_map_to_statuses() {
        assert_eq!(
            HttpError::from(StoreError::NotFound("7".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HttpError::from(StoreError::InvalidTransition {
                id: 7,
                current: "completed".to_string(),
                requested: DonationStatus::Allocated,
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HttpError::from(StoreError::Database(DbErr::Custom("down".to_string()))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn cors_echoes_configured_origin() {
        let app = offline_app_with_origins(&["https://learn.example.org".to_string()]);
        let request = Request::get("/health")
            .header("origin", "https://learn.example.org")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://learn.example.org"
        );
    }

    #[tokio::test]
    async fn cors_ignores_unlisted_origin() {
        let app = offline_app_with_origins(&["https://learn.example.org".to_string()]);
        let request = Request::get("/health")
            .header("origin", "https://elsewhere.example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}

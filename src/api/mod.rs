//! HTTP API for swap intake, status, and monitoring

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::{Coordinator, SweepReport};
use crate::error::{RelayerError, RelayerResult};
use crate::state::{StatusTransition, SwapStats, SwapStore};
use crate::swap::{Chain, Swap, SwapRequest};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SwapStore>,
    pub coordinator: Coordinator,
    pub chain_manager: Arc<ChainManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/swaps", post(initiate_swap).get(list_swaps))
        .route("/swaps/:id", get(get_swap))
        .route("/stats", get(get_stats))
        .route("/admin/sweep", post(run_sweep))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Maps relayer errors onto HTTP statuses
struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayerError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayerError::SwapNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Server-side detail stays in the log
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify store and both chains
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

async fn initiate_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let swap_id = state.coordinator.initiate_swap(request).await?;
    Ok((StatusCode::CREATED, Json(InitiateResponse { swap_id })))
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapDetail>, ApiError> {
    let swap = state
        .store
        .get_swap(&id)
        .await?
        .ok_or_else(|| RelayerError::SwapNotFound { swap_id: id.clone() })?;
    let transitions = state.store.get_transitions(&id).await?;

    Ok(Json(SwapDetail { swap, transitions }))
}

async fn list_swaps(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Swap>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.store.list_swaps(limit).await?))
}

/// Get swap statistics
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let swaps = state.store.get_stats().await?;
    Ok(Json(StatsResponse {
        swaps,
        active_swaps: state.coordinator.active_swaps(),
    }))
}

/// Run a refund sweep now instead of waiting for the timer
async fn run_sweep(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.coordinator.sweep_now().await? {
        Some(report) => Ok(Json::<SweepReport>(report).into_response()),
        None => Ok((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "a refund sweep is already running".to_string(),
            }),
        )
            .into_response()),
    }
}

// Request and response types

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    swap_id: String,
}

#[derive(Serialize)]
struct SwapDetail {
    #[serde(flatten)]
    swap: Swap,
    transitions: Vec<StatusTransition>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: Chain,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    swaps: SwapStats,
    active_swaps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainAdapters;
    use crate::coordination::{CoordinatorSettings, ManualClock};
    use crate::state::InMemorySwapStore;
    use crate::swap::SwapDirection;
    use crate::testing::{swap_request, FakeChain};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const NOW: u64 = 1_700_000_000;

    fn app() -> Router {
        let store: Arc<dyn SwapStore> = Arc::new(InMemorySwapStore::new());
        let adapters = ChainAdapters::new(
            Arc::new(FakeChain::new(Chain::Evm)),
            Arc::new(FakeChain::new(Chain::Aptos)),
        );
        let settings = CoordinatorSettings {
            timelock_safety_margin_secs: 1800,
            min_timelock_window_secs: 600,
            sweep_interval: Duration::from_secs(600),
            retry_interval: Duration::from_secs(60),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        };
        let coordinator = Coordinator::new(
            store.clone(),
            adapters.clone(),
            Arc::new(ManualClock::new(NOW)),
            settings,
        );

        router(AppState {
            store,
            coordinator,
            chain_manager: Arc::new(ChainManager::new(adapters, Vec::new())),
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = app();

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"][1]["chain"], "aptos");
    }

    #[tokio::test]
    async fn test_initiate_then_fetch_swap() {
        let app = app();
        let request = serde_json::to_value(swap_request(SwapDirection::EvmToAptos, NOW + 3600))
            .unwrap();

        let (status, body) = send(&app, post_json("/swaps", request)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["swapId"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get(&format!("/swaps/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["destinationTimelock"], NOW + 1800);
        assert_eq!(body["transitions"], json!([]));

        let (_, body) = send(&app, get("/swaps?limit=10")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = send(&app, get("/stats")).await;
        assert_eq!(body["pending"], 1);
    }

    #[tokio::test]
    async fn test_rejected_intent_is_bad_request() {
        let app = app();
        let request = serde_json::to_value(swap_request(SwapDirection::AptosToEvm, NOW + 60))
            .unwrap();

        let (status, body) = send(&app, post_json("/swaps", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("too soon"));
    }

    #[tokio::test]
    async fn test_unknown_swap_is_not_found() {
        let (status, _) = send(&app(), get("/swaps/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_errors_hide_detail() {
        let response =
            ApiError(RelayerError::Internal("pool timed out on 10.0.0.5:5432".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal error");
        assert!(!bytes.windows(8).any(|w| w == b"10.0.0.5"));
    }

    #[tokio::test]
    async fn test_admin_sweep_reports() {
        let (status, body) = send(&app(), post_json("/admin/sweep", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected"], 0);
    }
}

//! HTTP server implementation using Axum.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::error::PoolError;
use crate::ledger::Money;
use crate::pool::{CostStatus, PoolManager, PoolStatus};
use crate::state::DemoSession;

/// Requesters that send no identity are grouped under this key.
const ANONYMOUS_REQUESTER: &str = "anonymous";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
}

impl AppState {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }
}

// Request/Response types
#[derive(Deserialize, Default)]
struct ClaimRequest {
    #[serde(default)]
    requester_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ClaimResponse {
    pub session_id: Uuid,
    pub sandbox_endpoint: String,
    pub expires_at: DateTime<Utc>,
    pub usage_remaining: u32,
}

#[derive(Deserialize, Default)]
struct UsageRequest {
    #[serde(default)]
    cost_estimate: Money,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UsageResponse {
    pub usage_remaining: u32,
    pub time_remaining: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub requester_id: String,
    pub sandbox_id: String,
    pub status: String,
    pub usage_used: u32,
    pub usage_remaining: u32,
    pub time_remaining_secs: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// Handler errors: pool outcomes plus request bodies that fail to parse.
pub enum ApiError {
    Pool {
        error: PoolError,
        retry_after: Duration,
    },
    InvalidBody(JsonRejection),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error, retry_after) = match self {
            ApiError::Pool { error, retry_after } => (error, retry_after),
            ApiError::InvalidBody(rejection) => {
                let body = ErrorBody {
                    error: rejection.body_text(),
                    code: "invalid_request",
                };
                return (rejection.status(), Json(body)).into_response();
            }
        };

        let status = match &error {
            PoolError::PoolEmpty | PoolError::BudgetExhausted => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            PoolError::SessionExpired(_) | PoolError::UsageExceeded { .. } => StatusCode::GONE,
            PoolError::Ledger(_) => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorBody {
            error: error.to_string(),
            code: error.code(),
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(error, PoolError::PoolEmpty) {
            let secs = retry_after.as_secs().max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl AppState {
    fn api_error(&self, error: PoolError) -> ApiError {
        ApiError::Pool {
            error,
            retry_after: self.pool.config().replenish_interval,
        }
    }
}

/// An empty body means "all defaults"; anything else must be valid JSON for `T`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let Json(req) = Json::<T>::from_bytes(body)?;
    Ok(req)
}

/// Builds the API router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/claim", post(claim))
        .route("/sessions/:id", get(get_session).delete(release_session))
        .route("/sessions/:id/usage", post(apply_usage))
        .route("/availability", get(availability))
        .route("/cost", get(cost))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn claim(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ClaimResponse>, ApiError> {
    let req: ClaimRequest = parse_body(&body)?;
    let requester = req
        .requester_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| ANONYMOUS_REQUESTER.to_string());

    let session = state
        .pool
        .claim(&requester)
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(ClaimResponse {
        session_id: session.id,
        sandbox_endpoint: session.sandbox.endpoint.clone(),
        expires_at: wall_clock(session.expires_at),
        usage_remaining: session.usage_remaining(),
    }))
}

async fn apply_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<UsageResponse>, ApiError> {
    let req: UsageRequest = parse_body(&body)?;
    let receipt = state
        .pool
        .apply_usage(id, req.cost_estimate)
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(UsageResponse {
        usage_remaining: receipt.usage_remaining,
        time_remaining: receipt.time_remaining.as_secs(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state
        .pool
        .session(id)
        .await
        .ok_or_else(|| state.api_error(PoolError::SessionNotFound(id)))?;
    Ok(Json(session_info(&session)))
}

async fn release_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .pool
        .release(id)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn availability(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.pool.availability().await)
}

async fn cost(State(state): State<AppState>) -> Json<CostStatus> {
    Json(state.pool.cost_status())
}

fn session_info(session: &DemoSession) -> SessionInfo {
    SessionInfo {
        session_id: session.id,
        requester_id: session.requester_id.clone(),
        sandbox_id: session.sandbox.id.clone(),
        status: session.status.as_str().to_string(),
        usage_used: session.usage_count,
        usage_remaining: session.usage_remaining(),
        time_remaining_secs: session.time_remaining(Instant::now()).as_secs(),
    }
}

/// Converts a monotonic deadline into a wall-clock timestamp.
fn wall_clock(deadline: Instant) -> DateTime<Utc> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
}

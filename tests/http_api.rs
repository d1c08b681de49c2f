//! HTTP API tests against the axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use warmpool::fakes::{MockLedger, MockProvisioner};
use warmpool::http_server::{router, AppState, ClaimResponse, UsageResponse};
use warmpool::replenish::Replenisher;
use warmpool::{CostLedger, DailyLedger, Money, PoolConfig, PoolManager};

fn config() -> PoolConfig {
    PoolConfig {
        target_warm_count: 2,
        max_concurrent_provisioning: 2,
        idle_age_threshold: Duration::from_secs(600),
        max_session_duration: Duration::from_secs(60),
        max_usage_per_session: 3,
        replenish_interval: Duration::from_secs(5),
        reaper_interval: Duration::from_secs(1),
        daily_cost_cap: Money::from_cents(1_000),
        flavor: "node-starter".to_string(),
        provision_cost: Money::from_cents(10),
        empty_grace_period: Duration::from_secs(30),
        retire_batch_size: 2,
        budget_alert_threshold: 80,
    }
}

async fn warm_app() -> (Router, Arc<DailyLedger>) {
    let config = config();
    let ledger = Arc::new(DailyLedger::new(config.daily_cost_cap, 80));
    let app = warm_app_with(config, ledger.clone()).await;
    (app, ledger)
}

async fn warm_app_with(config: PoolConfig, ledger: Arc<dyn CostLedger>) -> Router {
    let pool = Arc::new(PoolManager::new(config, ledger));
    let mut replenisher = Replenisher::new(pool.clone(), Arc::new(MockProvisioner::new()));
    replenisher.tick().await;
    replenisher.settle().await;
    router(AppState::new(pool))
}

async fn send_raw(app: &Router, uri: &str, body: &'static str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, value)
}

async fn claim(app: &Router, requester: &str) -> ClaimResponse {
    let (status, _, body) = send(
        app,
        Method::POST,
        "/claim",
        Some(json!({ "requester_id": requester })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(body).unwrap()
}

#[tokio::test(start_paused = true)]
async fn availability_reports_counts() {
    let (app, _) = warm_app().await;
    let (status, _, body) = send(&app, Method::GET, "/availability", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "available": true, "warm_count": 2, "active_count": 0 })
    );
}

#[tokio::test(start_paused = true)]
async fn claims_until_pool_is_empty() {
    let (app, _) = warm_app().await;

    let first = claim(&app, "ip-1").await;
    assert_eq!(first.usage_remaining, 3);
    assert!(first.sandbox_endpoint.starts_with("mock://"));

    // No body at all is an anonymous claim.
    let (status, _, _) = send(&app, Method::POST, "/claim", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send(&app, Method::POST, "/claim", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "pool_empty");
    assert_eq!(headers[header::RETRY_AFTER], "5");

    let (_, _, body) = send(&app, Method::GET, "/availability", None).await;
    assert_eq!(body["warm_count"], 0);
    assert_eq!(body["active_count"], 2);
}

#[tokio::test(start_paused = true)]
async fn usage_is_capped_per_session() {
    let (app, ledger) = warm_app().await;
    let session = claim(&app, "ip-1").await;
    let uri = format!("/sessions/{}/usage", session.session_id);

    for expected in [2, 1, 0] {
        let (status, _, body) =
            send(&app, Method::POST, &uri, Some(json!({ "cost_estimate": 5 }))).await;
        assert_eq!(status, StatusCode::OK);
        let receipt: UsageResponse = serde_json::from_value(body).unwrap();
        assert_eq!(receipt.usage_remaining, expected);
        assert!(receipt.time_remaining <= 60);
    }

    let (status, _, body) = send(&app, Method::POST, &uri, Some(json!({ "cost_estimate": 5 }))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "usage_exceeded");

    // Two provisioned sandboxes plus three usage charges.
    assert_eq!(ledger.spent(), Money::from_cents(35));
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_gone() {
    let (app, _) = warm_app().await;
    let session = claim(&app, "ip-1").await;

    tokio::time::advance(Duration::from_secs(61)).await;
    let uri = format!("/sessions/{}/usage", session.session_id);
    let (status, _, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "session_expired");

    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/sessions/{}", session.session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "expired");
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_blocks_usage() {
    let (app, ledger) = warm_app().await;
    let session = claim(&app, "ip-1").await;
    ledger.record_spend(Money::from_cents(1_000)).await.unwrap();

    let uri = format!("/sessions/{}/usage", session.session_id);
    let (status, _, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "budget_exhausted");

    let (_, _, body) = send(&app, Method::GET, "/availability", None).await;
    assert_eq!(body["available"], false);

    let (status, _, body) = send(&app, Method::GET, "/cost", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exhausted"], true);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["daily_cap"], 1_000);
}

#[tokio::test(start_paused = true)]
async fn release_is_idempotent() {
    let (app, _) = warm_app().await;
    let session = claim(&app, "ip-1").await;
    let uri = format!("/sessions/{}", session.session_id);

    let (status, _, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requester_id"], "ip-1");
    assert_eq!(body["status"], "active");

    for _ in 0..2 {
        let (status, _, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (status, _, _) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let unknown = format!("/sessions/{}", Uuid::new_v4());
    let (status, _, _) = send(&app, Method::DELETE, &unknown, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn unknown_session_usage_is_not_found() {
    let (app, _) = warm_app().await;
    let uri = format!("/sessions/{}/usage", Uuid::new_v4());
    let (status, _, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "session_not_found");
}

#[tokio::test(start_paused = true)]
async fn health_check_responds() {
    let (app, _) = warm_app().await;
    let (status, _, _) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn malformed_usage_body_is_rejected_and_not_charged() {
    let (app, ledger) = warm_app().await;
    let session = claim(&app, "ip-1").await;
    let uri = format!("/sessions/{}/usage", session.session_id);
    let spent = ledger.spent();

    let (status, body) = send_raw(&app, &uri, r#"{"cost_estimate":"five dollars"}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_request");

    let (status, body) = send_raw(&app, &uri, "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    assert_eq!(ledger.spent(), spent);
    let (_, _, body) = send(&app, Method::GET, &format!("/sessions/{}", session.session_id), None).await;
    assert_eq!(body["usage_used"], 0);

    // An empty body still means defaults.
    let (status, _) = send_raw(&app, &uri, "").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn malformed_claim_body_is_rejected() {
    let (app, _) = warm_app().await;
    let (status, body) = send_raw(&app, "/claim", r#"{"requester_id":5}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_request");

    let (_, _, body) = send(&app, Method::GET, "/availability", None).await;
    assert_eq!(body["warm_count"], 2);
}

#[tokio::test(start_paused = true)]
async fn ledger_failure_is_bad_gateway() {
    let ledger = Arc::new(MockLedger::new(Money::from_cents(1_000)));
    let app = warm_app_with(config(), ledger.clone()).await;
    let session = claim(&app, "ip-1").await;

    ledger.set_failing(true);
    let uri = format!("/sessions/{}/usage", session.session_id);
    let (status, _, body) = send(&app, Method::POST, &uri, Some(json!({ "cost_estimate": 5 }))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "ledger_error");

    let (_, _, body) = send(&app, Method::GET, &format!("/sessions/{}", session.session_id), None).await;
    assert_eq!(body["usage_used"], 0);
    assert_eq!(body["usage_remaining"], 3);
}

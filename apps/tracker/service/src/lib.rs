//! HTTP surface of the Silksong release tracker's newsletter backend.
//!
//! Exposes the double opt-in subscription flow: `POST
//! /api/newsletter/subscribe` issues a pending confirmation token and
//! sends the confirmation email; `GET /api/newsletter/confirm/:token`
//! turns a pending token into a durable subscriber record. Both routes sit
//! behind process-local sliding-window throttles keyed by client IP.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub mod api_envelope;
pub mod config;
pub mod observability;
pub mod subscriptions;

use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, error_response, error_response_with_status, not_found_error,
    ok_data, validation_error,
};
use crate::config::Config;
use crate::observability::{AuditEvent, Observability};
use crate::subscriptions::{SubscriptionError, SubscriptionService};

const SERVICE_NAME: &str = "tracker-subscribe-service";
const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_X_REAL_IP: &str = "x-real-ip";
const HEADER_X_REQUEST_ID: &str = "x-request-id";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    subscriptions: SubscriptionService,
    observability: Observability,
    throttle_state: ThrottleState,
    started_at: SystemTime,
}

#[derive(Clone, Default)]
struct ThrottleState {
    buckets: Arc<Mutex<HashMap<String, VecDeque<i64>>>>,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    email_transport: &'static str,
    subscribers: usize,
    pending_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    subscribe_store: String,
}

pub fn build_router(config: Config) -> Router {
    build_router_with_observability(config, Observability::default())
}

pub fn build_router_with_observability(config: Config, observability: Observability) -> Router {
    let subscriptions = SubscriptionService::from_config(&config);
    let state = AppState {
        config: Arc::new(config),
        subscriptions,
        observability,
        throttle_state: ThrottleState::default(),
        started_at: SystemTime::now(),
    };

    router_from_state(state)
}

fn router_from_state(state: AppState) -> Router {
    let subscribe_throttle_state = state.clone();
    let confirm_throttle_state = state.clone();

    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route(
            "/api/newsletter/subscribe",
            post(subscribe_newsletter).route_layer(middleware::from_fn_with_state(
                subscribe_throttle_state,
                throttle_subscribe_gate,
            )),
        )
        .route(
            "/api/newsletter/confirm/:token",
            get(confirm_newsletter).route_layer(middleware::from_fn_with_state(
                confirm_throttle_state,
                throttle_confirm_gate,
            )),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        email_transport: state.subscriptions.transport_name(),
        subscribers: state.subscriptions.subscriber_count().await,
        pending_tokens: state.subscriptions.pending_count().await,
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let Some(path) = state.config.subscribe_store_path.as_ref() else {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                subscribe_store: "memory".to_string(),
            }),
        );
    };

    let subscribe_store = path.to_string_lossy().to_string();
    let parent_exists = path
        .parent()
        .map(|parent| parent.as_os_str().is_empty() || parent.is_dir())
        .unwrap_or(true);

    if parent_exists {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                subscribe_store,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                subscribe_store,
            }),
        )
    }
}

async fn subscribe_newsletter(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);

    // Collapse every body rejection (missing content type, malformed or
    // type-mismatched JSON) to 400 in the standard envelope.
    let Json(payload) = payload.map_err(|rejection| {
        tracing::debug!(
            target: "tracker",
            request_id = %request_id,
            rejection = %rejection,
            "rejected subscribe request body",
        );
        error_response_with_status(
            StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidRequest,
            "Request body must be a JSON object with an email field.",
        )
    })?;

    let issued = match state.subscriptions.subscribe(payload.email).await {
        Ok(issued) => issued,
        Err(error) => {
            emit_subscription_failure(&state, &request_id, "newsletter.subscribe.failed", &error);
            return Err(map_subscription_error(error));
        }
    };

    state.observability.audit(
        AuditEvent::new("newsletter.subscribe.requested", request_id.clone())
            .with_attribute("transport", state.subscriptions.transport_name())
            .with_attribute(
                "email_domain",
                email_domain(&issued.email).unwrap_or_else(|| "unknown".to_string()),
            ),
    );
    state
        .observability
        .increment_counter("newsletter.subscribe.requested", &request_id);

    // The token travels only inside the confirmation email.
    Ok(ok_data(serde_json::json!({
        "status": "confirmation-sent",
        "email": issued.email,
        "expiresAt": timestamp(issued.expires_at),
    })))
}

async fn confirm_newsletter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);

    let confirmed = match state.subscriptions.confirm(&token).await {
        Ok(confirmed) => confirmed,
        Err(error) => {
            emit_subscription_failure(&state, &request_id, "newsletter.confirm.failed", &error);
            return Err(map_subscription_error(error));
        }
    };

    state.observability.audit(
        AuditEvent::new("newsletter.confirm.completed", request_id.clone())
            .with_attribute(
                "email_domain",
                email_domain(&confirmed.subscriber.email).unwrap_or_else(|| "unknown".to_string()),
            )
            .with_attribute(
                "already_confirmed",
                if confirmed.already_confirmed {
                    "true"
                } else {
                    "false"
                },
            ),
    );
    state
        .observability
        .increment_counter("newsletter.confirm.completed", &request_id);

    let status = if confirmed.already_confirmed {
        "already-subscribed"
    } else {
        "subscribed"
    };

    Ok(ok_data(serde_json::json!({
        "status": status,
        "email": confirmed.subscriber.email,
        "subscribedAt": timestamp(confirmed.subscriber.subscribed_at),
    })))
}

async fn throttle_subscribe_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = format!(
        "newsletter.subscribe:{}",
        request_identity_key(request.headers())
    );
    match consume_throttle_token(
        &state.throttle_state,
        &key,
        state.config.throttle_subscribe_limit,
        state.config.throttle_subscribe_window_seconds,
    )
    .await
    {
        Ok(()) => next.run(request).await,
        Err(retry_after_seconds) => error_response_with_status(
            StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::RateLimited,
            format!("Too many requests. Retry in {retry_after_seconds}s."),
        )
        .into_response(),
    }
}

async fn throttle_confirm_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = format!(
        "newsletter.confirm:{}",
        request_identity_key(request.headers())
    );
    match consume_throttle_token(
        &state.throttle_state,
        &key,
        state.config.throttle_confirm_limit,
        state.config.throttle_confirm_window_seconds,
    )
    .await
    {
        Ok(()) => next.run(request).await,
        Err(retry_after_seconds) => error_response_with_status(
            StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::RateLimited,
            format!("Too many requests. Retry in {retry_after_seconds}s."),
        )
        .into_response(),
    }
}

async fn consume_throttle_token(
    throttle_state: &ThrottleState,
    bucket_key: &str,
    max_requests: usize,
    window_seconds: i64,
) -> Result<(), i64> {
    let now_epoch = Utc::now().timestamp();
    let window_start = now_epoch - window_seconds;

    let mut buckets = throttle_state.buckets.lock().await;

    // Drop buckets on this route whose newest entry is already outside
    // the window, so the map does not grow one entry per client forever.
    let (route, _) = bucket_key.split_once(':').unwrap_or((bucket_key, ""));
    buckets.retain(|key, bucket| {
        !key.starts_with(route) || bucket.back().is_some_and(|newest| *newest >= window_start)
    });

    let bucket = buckets.entry(bucket_key.to_string()).or_default();

    while let Some(oldest) = bucket.front() {
        if *oldest < window_start {
            let _ = bucket.pop_front();
        } else {
            break;
        }
    }

    if bucket.len() >= max_requests {
        let retry_after = bucket
            .front()
            .map(|oldest| ((*oldest + window_seconds) - now_epoch).max(1))
            .unwrap_or(1);
        return Err(retry_after);
    }

    bucket.push_back(now_epoch);
    Ok(())
}

fn map_subscription_error(error: SubscriptionError) -> ApiErrorTuple {
    match error {
        SubscriptionError::Validation { field, message } => validation_error(field, &message),
        SubscriptionError::Cooldown {
            retry_after_seconds,
        } => error_response_with_status(
            StatusCode::CONFLICT,
            ApiErrorCode::Conflict,
            format!("A confirmation email was sent recently. Retry in {retry_after_seconds}s."),
        ),
        SubscriptionError::InvalidToken => error_response(
            ApiErrorCode::InvalidRequest,
            "That confirmation link is not valid.",
        ),
        SubscriptionError::NotFound => {
            not_found_error("That confirmation link was not found. Request a new one.")
        }
        SubscriptionError::Expired => error_response(
            ApiErrorCode::Gone,
            "That confirmation link has expired. Request a new one.",
        ),
        SubscriptionError::Provider { message } => {
            tracing::error!(target: "tracker.subscriptions", error = %message, "email transport failure");
            error_response(
                ApiErrorCode::ProviderUnavailable,
                "Could not send the confirmation email. Try again later.",
            )
        }
        SubscriptionError::Storage { message } => {
            tracing::error!(target: "tracker.subscriptions", error = %message, "subscription store failure");
            error_response(
                ApiErrorCode::InternalError,
                "Something went wrong. Try again later.",
            )
        }
    }
}

fn emit_subscription_failure(
    state: &AppState,
    request_id: &str,
    event_name: &str,
    error: &SubscriptionError,
) {
    let reason = match error {
        SubscriptionError::Validation { .. } => "validation",
        SubscriptionError::Cooldown { .. } => "cooldown",
        SubscriptionError::InvalidToken => "invalid_token",
        SubscriptionError::NotFound => "not_found",
        SubscriptionError::Expired => "expired",
        SubscriptionError::Provider { .. } => "provider",
        SubscriptionError::Storage { .. } => "storage",
    };

    state.observability.audit(
        AuditEvent::new(event_name, request_id.to_string()).with_attribute("reason", reason),
    );
    state.observability.increment_counter(event_name, request_id);
}

fn request_identity_key(headers: &HeaderMap) -> String {
    if let Some(value) = header_string(headers, HEADER_X_FORWARDED_FOR) {
        let first_ip = value.split(',').next().unwrap_or_default().trim();
        if !first_ip.is_empty() {
            return format!("ip:{first_ip}");
        }
    }

    if let Some(value) = header_string(headers, HEADER_X_REAL_IP) {
        let ip = value.trim();
        if !ip.is_empty() {
            return format!("ip:{ip}");
        }
    }

    "ip:unknown".to_string()
}

fn request_id(headers: &HeaderMap) -> String {
    header_string(headers, HEADER_X_REQUEST_ID)
        .unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()))
}

fn header_string(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

fn email_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_string())
        .filter(|domain| !domain.is_empty())
}

fn timestamp(value: chrono::DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::{AppState, ThrottleState, router_from_state};
    use crate::build_router;
    use crate::config::Config;
    use crate::observability::{Observability, RecordingAuditSink};
    use crate::subscriptions::{
        EmailDelivery, EmailTransport, MockEmailTransport, SubscriptionError, SubscriptionService,
    };

    fn test_config() -> Config {
        Config::for_tests()
    }

    fn test_app_state(config: Config) -> AppState {
        test_app_state_with(
            config.clone(),
            Arc::new(MockEmailTransport::default()),
            Observability::default(),
        )
    }

    fn test_app_state_with(
        config: Config,
        transport: Arc<dyn EmailTransport>,
        observability: Observability,
    ) -> AppState {
        let subscriptions = SubscriptionService::with_transport(&config, transport);
        AppState {
            config: Arc::new(config),
            subscriptions,
            observability,
            throttle_state: ThrottleState::default(),
            started_at: std::time::SystemTime::now(),
        }
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl EmailTransport for FailingTransport {
        async fn send_confirmation(
            &self,
            _to: &str,
            _confirm_url: &str,
        ) -> std::result::Result<EmailDelivery, SubscriptionError> {
            Err(SubscriptionError::Provider {
                message: "simulated outage".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn subscribe_request(email: &str, forwarded_for: &str) -> Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri("/api/newsletter/subscribe")
            .header("content-type", "application/json")
            .header("x-forwarded-for", forwarded_for)
            .body(Body::from(json!({ "email": email }).to_string()))?)
    }

    fn confirm_request(token: &str, forwarded_for: &str) -> Result<Request<Body>> {
        Ok(Request::builder()
            .uri(format!("/api/newsletter/confirm/{token}"))
            .header("x-forwarded-for", forwarded_for)
            .body(Body::empty())?)
    }

    async fn read_json(response: axum::response::Response) -> Result<Value> {
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn healthz_route_returns_ok() -> Result<()> {
        let app = build_router(test_config());
        let request = Request::builder().uri("/healthz").body(Body::empty())?;
        let response = app.oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "tracker-subscribe-service");
        assert_eq!(body["email_transport"], "mock");
        assert_eq!(body["subscribers"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn readiness_route_is_ready_without_store_path() -> Result<()> {
        let app = build_router(test_config());
        let request = Request::builder().uri("/readyz").body(Body::empty())?;
        let response = app.oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["subscribe_store"], "memory");
        Ok(())
    }

    #[tokio::test]
    async fn readiness_route_is_not_ready_when_store_parent_missing() -> Result<()> {
        let dir = tempdir()?;
        let mut config = test_config();
        config.subscribe_store_path = Some(dir.path().join("missing").join("subscriptions.json"));
        let app = build_router(config);

        let request = Request::builder().uri("/readyz").body(Body::empty())?;
        let response = app.oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = read_json(response).await?;
        assert_eq!(body["status"], "not_ready");
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_then_confirm_flow_creates_one_subscriber() -> Result<()> {
        let state = test_app_state(test_config());
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .clone()
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.1")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["data"]["status"], "confirmation-sent");
        assert_eq!(body["data"]["email"], "player@hollownest.example");
        assert!(
            body["data"].get("token").is_none(),
            "token must not leak into the subscribe response"
        );

        let token = service
            .pending_token_for("player@hollownest.example")
            .await
            .unwrap_or_default();
        assert_eq!(token.len(), crate::subscriptions::TOKEN_LENGTH);

        let response = app
            .clone()
            .oneshot(confirm_request(&token, "203.0.113.1")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["data"]["status"], "subscribed");
        assert_eq!(body["data"]["email"], "player@hollownest.example");

        let response = app.oneshot(confirm_request(&token, "203.0.113.1")?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["data"]["status"], "already-subscribed");

        assert_eq!(service.subscriber_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_email_with_field_error() -> Result<()> {
        let state = test_app_state(test_config());
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .oneshot(subscribe_request("not-an-email", "203.0.113.2")?)
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "invalid_request");
        assert!(body["errors"]["email"][0].is_string());
        assert_eq!(service.pending_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_without_content_type_returns_envelope_400() -> Result<()> {
        let app = build_router(test_config());

        let request = Request::builder()
            .method("POST")
            .uri("/api/newsletter/subscribe")
            .header("x-forwarded-for", "203.0.113.12")
            .body(Body::from(
                json!({ "email": "player@hollownest.example" }).to_string(),
            ))?;
        let response = app.oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_with_mismatched_body_returns_envelope_400() -> Result<()> {
        let app = build_router(test_config());

        for payload in [json!({ "email": 5 }).to_string(), "not json".to_string()] {
            let request = Request::builder()
                .method("POST")
                .uri("/api/newsletter/subscribe")
                .header("content-type", "application/json")
                .header("x-forwarded-for", "203.0.113.13")
                .body(Body::from(payload.clone()))?;
            let response = app.clone().oneshot(request).await?;

            assert_eq!(
                response.status(),
                StatusCode::BAD_REQUEST,
                "expected 400 for body {payload}"
            );
            let body = read_json(response).await?;
            assert_eq!(body["error"]["code"], "invalid_request");
        }
        Ok(())
    }

    #[tokio::test]
    async fn throttle_sweep_drops_stale_buckets_on_the_same_route() -> Result<()> {
        let throttle_state = ThrottleState::default();
        let stale_epoch = chrono::Utc::now().timestamp() - 3600;
        {
            let mut buckets = throttle_state.buckets.lock().await;
            buckets.insert(
                "newsletter.subscribe:ip:198.51.100.1".to_string(),
                std::collections::VecDeque::from([stale_epoch]),
            );
            buckets.insert(
                "newsletter.confirm:ip:198.51.100.1".to_string(),
                std::collections::VecDeque::from([stale_epoch]),
            );
        }

        let outcome = super::consume_throttle_token(
            &throttle_state,
            "newsletter.subscribe:ip:198.51.100.2",
            10,
            60,
        )
        .await;
        assert!(outcome.is_ok());

        let buckets = throttle_state.buckets.lock().await;
        assert!(!buckets.contains_key("newsletter.subscribe:ip:198.51.100.1"));
        assert!(buckets.contains_key("newsletter.subscribe:ip:198.51.100.2"));
        // Other routes keep their own windows; the sweep must not cross.
        assert!(buckets.contains_key("newsletter.confirm:ip:198.51.100.1"));
        Ok(())
    }

    #[tokio::test]
    async fn confirm_rejects_malformed_unknown_and_expired_tokens() -> Result<()> {
        let state = test_app_state(test_config());
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .clone()
            .oneshot(confirm_request("not-hex", "203.0.113.3")?)
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "invalid_request");

        let response = app
            .clone()
            .oneshot(confirm_request(
                "0123456789abcdef0123456789abcdef",
                "203.0.113.3",
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "not_found");

        let response = app
            .clone()
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.3")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let token = service
            .pending_token_for("player@hollownest.example")
            .await
            .unwrap_or_default();
        service.backdate_pending(&token, 48 * 3600 + 60).await;

        let response = app.oneshot(confirm_request(&token, "203.0.113.3")?).await?;
        assert_eq!(response.status(), StatusCode::GONE);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "gone");
        Ok(())
    }

    #[tokio::test]
    async fn resubmit_inside_cooldown_returns_conflict() -> Result<()> {
        let app = build_router(test_config());

        let response = app
            .clone()
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.4")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.4")?)
            .await?;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "conflict");
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_route_enforces_throttle_limit() -> Result<()> {
        let config = test_config();
        let limit = config.throttle_subscribe_limit;
        let app = build_router(config);

        for index in 0..limit {
            let email = format!("player{index}@hollownest.example");
            let response = app
                .clone()
                .oneshot(subscribe_request(&email, "203.0.113.5")?)
                .await?;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(subscribe_request(
                "one-more@hollownest.example",
                "203.0.113.5",
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "rate_limited");
        Ok(())
    }

    #[tokio::test]
    async fn throttle_buckets_are_keyed_by_client_ip() -> Result<()> {
        let config = test_config();
        let limit = config.throttle_subscribe_limit;
        let app = build_router(config);

        for index in 0..limit {
            let email = format!("player{index}@hollownest.example");
            let response = app
                .clone()
                .oneshot(subscribe_request(&email, "203.0.113.6")?)
                .await?;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(subscribe_request(
                "other-client@hollownest.example",
                "198.51.100.7",
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_maps_to_bad_gateway_without_subscriber() -> Result<()> {
        let state = test_app_state_with(
            test_config(),
            Arc::new(FailingTransport),
            Observability::default(),
        );
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.8")?)
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = read_json(response).await?;
        assert_eq!(body["error"]["code"], "provider_unavailable");
        assert_eq!(service.subscriber_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn resend_mode_without_api_key_degrades_to_unavailable_transport() -> Result<()> {
        let mut config = test_config();
        config.email_provider_mode = "resend".to_string();
        config.resend_api_key = None;
        let app = build_router(config);

        let response = app
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.9")?)
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        Ok(())
    }

    #[tokio::test]
    async fn state_survives_router_restart_with_store_path() -> Result<()> {
        let dir = tempdir()?;
        let mut config = test_config();
        config.subscribe_store_path = Some(dir.path().join("subscriptions.json"));

        let state = test_app_state(config.clone());
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .clone()
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.10")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let token = service
            .pending_token_for("player@hollownest.example")
            .await
            .unwrap_or_default();
        let response = app.oneshot(confirm_request(&token, "203.0.113.10")?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let restarted = build_router(config);
        let request = Request::builder().uri("/healthz").body(Body::empty())?;
        let response = restarted.oneshot(request).await?;
        let body = read_json(response).await?;
        assert_eq!(body["subscribers"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn audit_events_carry_email_domain_only() -> Result<()> {
        let sink = Arc::new(RecordingAuditSink::default());
        let state = test_app_state_with(
            test_config(),
            Arc::new(MockEmailTransport::default()),
            Observability::with_sink(sink.clone()),
        );
        let service = state.subscriptions.clone();
        let app = router_from_state(state);

        let response = app
            .clone()
            .oneshot(subscribe_request("player@hollownest.example", "203.0.113.11")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let token = service
            .pending_token_for("player@hollownest.example")
            .await
            .unwrap_or_default();
        let response = app.oneshot(confirm_request(&token, "203.0.113.11")?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let events = sink.events();
        let names: Vec<&str> = events.iter().map(|event| event.name.as_str()).collect();
        assert!(names.contains(&"newsletter.subscribe.requested"));
        assert!(names.contains(&"newsletter.confirm.completed"));

        for event in &events {
            for (_, value) in &event.attributes {
                assert!(
                    !value.contains("player@"),
                    "audit attribute leaked a full email address: {value}"
                );
            }
        }
        Ok(())
    }
}

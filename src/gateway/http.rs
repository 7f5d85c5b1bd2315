use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use super::observability::ObservabilitySnapshot;
use super::usage::UsageScope;
use super::{CheckAllOutcome, Gateway, GatewayError, GatewayRequest, Rejection};

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection: Option<Rejection>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
}

#[derive(Debug, Serialize)]
struct ActiveUsersResponse {
    active_users: u64,
}

type HttpError = (StatusCode, HeaderMap, Json<ErrorResponse>);

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/admin/endpoints/health", get(endpoint_health))
        .route("/admin/endpoints/check", post(check_all_endpoints))
        .route("/admin/endpoints/check/:id", post(check_endpoint))
        .route("/admin/active-users", get(active_users))
        .route("/admin/usage/daily/:date", get(daily_usage))
        .route("/admin/usage/user/:id/:date", get(user_usage))
        .route("/admin/usage/model/:id/:date", get(model_usage))
        .route("/admin/usage/token/:id/:date", get(token_usage))
        .with_state(state)
}

async fn health(State(state): State<GatewayHttpState>) -> (StatusCode, Json<HealthResponse>) {
    match state.gateway.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: "ok",
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check: counter store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store: "unavailable",
                }),
            )
        }
    }
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, HttpError> {
    let token = extract_bearer(&headers)
        .or_else(|| extract_header(&headers, "x-api-key"))
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing api token")
        })?;
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "request body must name a model",
            )
        })?;

    let request = GatewayRequest {
        token,
        model,
        payload,
    };

    // Run on its own task so a disconnecting caller cannot cancel the
    // upstream call or the accounting that follows it.
    let gateway = state.gateway.clone();
    let task = tokio::spawn(async move { gateway.handle(request).await });
    let result = task.await.map_err(|err| {
        tracing::error!(error = %err, "request task failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "request task failed",
        )
    })?;

    let response = result.map_err(map_gateway_error)?;
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&response.endpoint_id) {
        headers.insert("x-tollgate-endpoint", value);
    }
    headers.insert("x-tollgate-attempts", HeaderValue::from(response.attempts));
    Ok((StatusCode::OK, headers, Json(response.body)).into_response())
}

async fn endpoint_health(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.gateway.endpoint_health().await).into_response())
}

async fn check_all_endpoints(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    ensure_admin(&state, &headers)?;
    let outcome = state.gateway.check_all_endpoints().await;
    let status = match outcome {
        CheckAllOutcome::Completed { .. } => StatusCode::OK,
        CheckAllOutcome::AlreadyRunning => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn check_endpoint(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, HttpError> {
    ensure_admin(&state, &headers)?;
    let status = state
        .gateway
        .check_endpoint(&id)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(status).into_response())
}

async fn active_users(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    ensure_admin(&state, &headers)?;
    let active_users = state
        .gateway
        .active_users()
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(ActiveUsersResponse { active_users }).into_response())
}

async fn usage(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    scope: UsageScope,
    id: &str,
    date: &str,
) -> Result<Response, HttpError> {
    ensure_admin(state, headers)?;
    let totals = state
        .gateway
        .usage_totals(scope, id, date)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(totals).into_response())
}

async fn daily_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(date): Path<String>,
) -> Result<Response, HttpError> {
    usage(&state, &headers, UsageScope::Daily, "", &date).await
}

async fn user_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path((id, date)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    usage(&state, &headers, UsageScope::User, &id, &date).await
}

async fn model_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path((id, date)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    usage(&state, &headers, UsageScope::Model, &id, &date).await
}

async fn token_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path((id, date)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    usage(&state, &headers, UsageScope::Token, &id, &date).await
}

fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_header(headers, "x-admin-token").unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> HttpError {
    (
        status,
        HeaderMap::new(),
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
            rejection: None,
        }),
    )
}

fn map_gateway_error(err: GatewayError) -> HttpError {
    let (status, code) = match &err {
        GatewayError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        GatewayError::UnknownModel { .. } => (StatusCode::NOT_FOUND, "unknown_model"),
        GatewayError::UnknownEndpoint { .. } => (StatusCode::NOT_FOUND, "unknown_endpoint"),
        GatewayError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
        GatewayError::LimitExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        GatewayError::BudgetExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "budget_exceeded"),
        GatewayError::NoHealthyEndpoint { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "no_healthy_endpoint")
        }
        GatewayError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
        GatewayError::UpstreamError { status_code, .. } => {
            // Client errors pass through; anything else is the gateway's bad upstream.
            let status = StatusCode::from_u16(*status_code)
                .ok()
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY);
            (status, "upstream_error")
        }
        GatewayError::CounterStoreUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "counter_store_unavailable")
        }
    };

    let rejection = err.rejection();
    let mut headers = HeaderMap::new();
    if let Some(retry_after_ms) = rejection.as_ref().and_then(|r| r.retry_after_ms) {
        let secs = retry_after_ms.div_ceil(1000).max(1);
        headers.insert("retry-after", HeaderValue::from(secs));
    }
    (
        status,
        headers,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: err.to_string(),
            },
            rejection,
        }),
    )
}

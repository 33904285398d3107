use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State as AxumState},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config_store::ConfigStore;
use crate::engine::{StatusSource, TriggerGuard};
use crate::error::AppError;

/// Shared state for the API server.
#[derive(Clone)]
pub struct ApiState {
    pub status: Arc<dyn StatusSource>,
    pub guard: Arc<TriggerGuard>,
    pub config_store: Arc<dyn ConfigStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/job-status", get(job_status))
        .route("/api/trigger-job", post(trigger_job))
        .route("/api/current-config", get(current_config))
        .route("/api/save-config", post(save_config))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Bind `0.0.0.0:port` and serve until Ctrl-C.
pub async fn serve(state: ApiState, port: u16) -> Result<(), AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Server shutting down");
        })
        .await?;
    Ok(())
}

/// `{ error, details }` body used by every failing route.
fn error_response(status: StatusCode, error: &str, details: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error, "details": details.to_string() })),
    )
        .into_response()
}

/// Log a route failure and build its 500 body.
fn internal_error(route: &str, error: &str, e: &AppError) -> Response {
    match e.raw_response() {
        Some(raw) => tracing::error!(route, kind = e.kind(), raw = %raw, "{}", e),
        None => tracing::error!(route, kind = e.kind(), "{}", e),
    }
    error_response(StatusCode::INTERNAL_SERVER_ERROR, error, e.details())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now() }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    since: Option<String>,
}

fn parse_since(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|s| !s.trim().is_empty())?;
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(since = %raw, "Ignoring unparseable since checkpoint: {}", e);
            None
        }
    }
}

/// GET /api/job-status?since=<ISO timestamp>
async fn job_status(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let since = parse_since(query.since.as_deref());
    match state.status.job_status(since).await {
        Ok(status) => ([(header::CACHE_CONTROL, "no-store")], Json(status)).into_response(),
        Err(e) => {
            let mut response = internal_error("/api/job-status", "Job status check failed", &e);
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
            response
        }
    }
}

/// POST /api/trigger-job
async fn trigger_job(AxumState(state): AxumState<Arc<ApiState>>) -> Response {
    match state.guard.trigger_job().await {
        Ok(outcome) => {
            tracing::info!(operation = %outcome.operation, "Job triggered successfully");
            Json(serde_json::json!({
                "success": true,
                "message": "Job triggered successfully",
                "operation": outcome.operation,
                "job": outcome.job,
            }))
            .into_response()
        }
        Err(AppError::Conflict { execution_id, start_time }) => {
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "Job is already running",
                    "executionId": execution_id,
                    "startTime": start_time,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error("/api/trigger-job", "Failed to trigger job", &e),
    }
}

/// GET /api/current-config
async fn current_config(AxumState(state): AxumState<Arc<ApiState>>) -> Response {
    match state.config_store.load().await {
        Ok(Some(config)) => Json(config).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Config file not found" })),
        )
            .into_response(),
        Err(e) => internal_error("/api/current-config", "Failed to fetch current config", &e),
    }
}

/// POST /api/save-config
async fn save_config(AxumState(state): AxumState<Arc<ApiState>>, body: Bytes) -> Response {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::json!({})
    } else {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "Configuration Update Failed", e)
            }
        }
    };

    match state.config_store.save(payload).await {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(outcome.body)).into_response()
        }
        Err(e) => internal_error("/api/save-config", "Configuration Update Failed", &e),
    }
}

async fn not_found(uri: Uri) -> Response {
    if uri.path().starts_with("/api") {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "API Route Not Found" })),
        )
            .into_response()
    } else {
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}

//! HTTP Server for Queries, Health and Metrics
//!
//! Read-only endpoints over already-persisted records, plus monitoring.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::error;

use crate::connection_registry::ConnectionRegistry;
use crate::metrics::RelayMetrics;
use crate::storage::{RecordStore, StoreError};

/// Records returned by `/records` when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 20;
/// Upper bound on `/records?limit=`.
pub const MAX_LIST_LIMIT: usize = 500;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn RecordStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

/// Middleware to check bearer token for metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let is_authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected_token);

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/records", get(list_records_handler))
        .route("/records/:timestamp", get(get_record_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .with_state(state)
}

fn store_failure(e: StoreError) -> Response {
    error!("Record query failed: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "Record store unavailable" })),
    )
        .into_response()
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "stroke-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics", "/records", "/records/{timestamp}"]
    }))
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.record_count())
        .await
        .ok()
        .and_then(Result::ok);
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.connected_count(),
        "records": records,
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

/// `GET /records?limit=N`: newest records as `{timestamp, name}`.
async fn list_records_handler(
    State(state): State<HttpState>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.list_recent(limit)).await {
        Ok(Ok(summaries)) => Json(summaries).into_response(),
        Ok(Err(e)) => store_failure(e),
        Err(e) => store_failure(StoreError::Unavailable(e.to_string())),
    }
}

/// `GET /records/{timestamp}`: the stored document.
async fn get_record_handler(
    State(state): State<HttpState>,
    Path(timestamp): Path<u64>,
) -> Response {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.get_by_timestamp(timestamp)).await {
        Ok(Ok(Some(record))) => Json(record.to_document()).into_response(),
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Record not found" })),
        )
            .into_response(),
        Ok(Err(e)) => store_failure(e),
        Err(e) => store_failure(StoreError::Unavailable(e.to_string())),
    }
}

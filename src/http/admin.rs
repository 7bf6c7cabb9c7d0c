//! Admin HTTP API over the health and management facade.
//!
//! ```text
//! GET    /health             -> store health (503 when unreachable)
//! GET    /status/{key}       -> count and expiry of one key
//! DELETE /limits/{pattern}   -> clear every key with a prefix
//! GET    /limiters           -> configured limiters
//! ```

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use crate::admin::Admin;
use crate::ratelimit::LimiterRegistry;

/// Shared state of the admin routes.
#[derive(Clone)]
pub struct AdminState {
    admin: Admin,
    registry: Arc<LimiterRegistry>,
}

impl AdminState {
    pub fn new(admin: Admin, registry: Arc<LimiterRegistry>) -> Self {
        Self { admin, registry }
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status/{key}", get(status))
        .route("/limits/{pattern}", delete(clear))
        .route("/limiters", get(limiters))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Response {
    let report = state.admin.check_health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn status(State(state): State<AdminState>, Path(key): Path<String>) -> Response {
    Json(state.admin.get_status(&key).await).into_response()
}

async fn clear(State(state): State<AdminState>, Path(pattern): Path<String>) -> Response {
    match state.admin.clear_limiter(&pattern).await {
        Ok(cleared) => Json(json!({ "cleared": cleared })).into_response(),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Failed to clear rate limit keys");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": { "message": e.to_string() } })),
            )
                .into_response()
        }
    }
}

async fn limiters(State(state): State<AdminState>) -> Response {
    Json(state.registry.configs()).into_response()
}

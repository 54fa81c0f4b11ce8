//! Health check handler

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};

use super::super::state::AppState;
use super::super::types::{ApiResponse, error_codes};

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub timestamp_ms: i64,
    pub git_hash: &'static str,
    /// Open presence channels and actors behind them
    pub channels: usize,
    pub online_actors: usize,
}

/// - Healthy: 200 OK + {code: 0, data: {...}}
/// - Database unreachable: 503 + {code: 5001, msg: "unavailable"}
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    if let Some(db) = &state.db {
        if let Err(e) = db.health_check().await {
            tracing::error!(error = %e, "Health check: database ping failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse {
                    code: error_codes::SERVICE_UNAVAILABLE,
                    msg: "unavailable".to_string(),
                    data: None,
                }),
            );
        }
    }

    let (online_actors, channels) = state.hub.stats();
    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            timestamp_ms: state.env.now().timestamp_millis(),
            git_hash: env!("GIT_HASH"),
            channels,
            online_actors,
        })),
    )
}

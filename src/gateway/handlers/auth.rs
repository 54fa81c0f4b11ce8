//! Token refresh handler

use std::sync::Arc;

use axum::{Json, extract::State};

use super::super::state::AppState;
use super::super::types::request::RefreshRequest;
use super::super::types::{ApiResponse, ValidatedJson};
use crate::auth::{AuthError, TokenPair};

pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<Json<ApiResponse<TokenPair>>, AuthError> {
    let pair = state.tokens.refresh(&req.refresh_token).await?;
    Ok(Json(ApiResponse::success(pair)))
}

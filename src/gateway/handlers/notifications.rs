//! Notification and device handlers

use std::sync::Arc;

use axum::{
    Extension,
    extract::{Path, Query, State},
};
use serde::Serialize;

use super::super::state::AppState;
use super::super::types::request::{DeviceRequest, NotificationListParams};
use super::super::types::{ApiResult, ValidatedJson, ok};
use crate::auth::AuthUser;
use crate::core_types::NotificationId;
use crate::notifications::{DeviceToken, ListQuery, Notification};

#[derive(Debug, Serialize)]
pub struct UnreadData {
    pub unread_count: i64,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<NotificationListParams>,
) -> ApiResult<Vec<Notification>> {
    let query = ListQuery {
        unread_only: params.unread_only,
        before_id: params.before_id,
        limit: params.limit.unwrap_or(ListQuery::default().limit),
    };
    ok(state.notifications.list(user.user_id, query).await?)
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<NotificationId>,
) -> ApiResult<UnreadData> {
    let unread_count = state.notifications.mark_read(user.user_id, id).await?;
    ok(UnreadData { unread_count })
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<UnreadData> {
    let unread_count = state.notifications.mark_all_read(user.user_id).await?;
    ok(UnreadData { unread_count })
}

pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<UnreadData> {
    let unread_count = state.notifications.unread_count(user.user_id).await?;
    ok(UnreadData { unread_count })
}

pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<DeviceRequest>,
) -> ApiResult<DeviceToken> {
    ok(state
        .notifications
        .register_device(user.user_id, &req.token, &req.platform)
        .await?)
}

//! Conversation handlers

use std::sync::Arc;

use axum::{
    Extension,
    extract::{Path, Query, State},
};
use serde::Serialize;

use super::super::state::AppState;
use super::super::types::request::{
    HistoryParams, MarkReadRequest, OpenConversationRequest, SendMessageRequest,
};
use super::super::types::{ApiResult, ValidatedJson, ok};
use crate::auth::AuthUser;
use crate::conversations::{Conversation, HistoryQuery, Message};
use crate::core_types::{ConversationId, MessageId};

#[derive(Debug, Serialize)]
pub struct ReadMarker {
    pub conversation_id: ConversationId,
    pub last_read_message_id: MessageId,
    pub unread_count: i64,
}

pub async fn open_conversation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<OpenConversationRequest>,
) -> ApiResult<Conversation> {
    ok(state
        .conversations
        .open(user.user_id, req.participants, req.booking_id)
        .await?)
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<ConversationId>,
    ValidatedJson(req): ValidatedJson<SendMessageRequest>,
) -> ApiResult<Message> {
    ok(state
        .conversations
        .send_message(user.user_id, id, &req.content)
        .await?)
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<ConversationId>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<Message>> {
    let query = HistoryQuery {
        before: params.before,
        limit: params.limit.unwrap_or(HistoryQuery::default().limit),
    };
    ok(state.conversations.history(user.user_id, id, query).await?)
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<ConversationId>,
    ValidatedJson(req): ValidatedJson<MarkReadRequest>,
) -> ApiResult<ReadMarker> {
    let marker = state
        .conversations
        .mark_read(user.user_id, id, req.up_to)
        .await?;
    let unread_count = state.conversations.unread_count(user.user_id, id).await?;
    ok(ReadMarker {
        conversation_id: id,
        last_read_message_id: marker,
        unread_count,
    })
}

pub async fn close_conversation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Conversation> {
    ok(state.conversations.close(user.user_id, id).await?)
}

//! WebSocket handler for presence channels
//!
//! `GET /ws/{scope}?token=<access token>[&conversation_id=<id>]` where scope
//! is `notifications`, `admin`, `monitor` or `conversation`.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::events::{ChannelEvent, ClientFrame};
use super::hub::{ChannelId, PresenceHub, Registration, Scope};
use crate::account::AccountService;
use crate::auth::AuthUser;
use crate::conversations::ConversationService;
use crate::core_types::ConversationId;
use crate::error::{CoreError, CoreResult};
use crate::gateway::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub token: String,
    pub conversation_id: Option<ConversationId>,
}

/// Map the requested scope to a hub scope the caller may subscribe to.
pub async fn resolve_scope(
    accounts: &AccountService,
    conversations: &ConversationService,
    user: AuthUser,
    scope: &str,
    conversation_id: Option<ConversationId>,
) -> CoreResult<Scope> {
    match scope {
        "notifications" => {
            accounts.actor(user.user_id).await?;
            Ok(Scope::UserNotifications(user.user_id))
        }
        "admin" => {
            accounts.require_admin(user.user_id).await?;
            Ok(Scope::AdminNotifications)
        }
        "monitor" => {
            accounts.require_admin(user.user_id).await?;
            Ok(Scope::UserMonitor)
        }
        "conversation" => {
            let id = conversation_id
                .ok_or_else(|| CoreError::validation("conversation_id is required"))?;
            conversations.authorize_channel(user.user_id, id).await?;
            Ok(Scope::Conversation(id))
        }
        other => Err(CoreError::validation(format!("unknown channel scope {}", other))),
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(scope): Path<String>,
    Query(params): Query<ChannelQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match state.tokens.verify_access(&params.token) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let scope = match resolve_scope(
        &state.accounts,
        &state.conversations,
        user,
        &scope,
        params.conversation_id,
    )
    .await
    {
        Ok(scope) => scope,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user, scope))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: AuthUser, scope: Scope) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.hub.clone();
    let Registration { id, mut rx } = hub.register(user.user_id, scope);

    let welcome = ChannelEvent::Connected {
        user_id: user.user_id,
        scope: scope.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            hub.unregister(id);
            return;
        }
    }

    let ping_every = Duration::from_secs(state.presence.ping_interval_secs);
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_every);
        ticker.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // unregistered by the hub (slow reader or scope closed)
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let read_deadline = Duration::from_secs(state.presence.read_deadline_secs);
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let msg = match tokio::time::timeout(read_deadline, receiver.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(_) => break,
                Err(_) => {
                    debug!(channel_id = id, "Read deadline passed, closing channel");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    handle_client_frame(
                        &recv_state.hub,
                        &recv_state.conversations,
                        user,
                        scope,
                        id,
                        text.as_str(),
                    )
                    .await
                }
                Message::Close(_) => break,
                // pongs only reset the deadline
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    hub.unregister(id);
}

pub async fn handle_client_frame(
    hub: &PresenceHub,
    conversations: &ConversationService,
    user: AuthUser,
    scope: Scope,
    channel: ChannelId,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(channel_id = channel, error = %e, "Ignoring unparsable client frame");
            return;
        }
    };
    match frame {
        ClientFrame::Ping => {
            hub.send_to(channel, ChannelEvent::Pong);
        }
        ClientFrame::MarkRead { up_to } => {
            let Scope::Conversation(conversation_id) = scope else {
                debug!(channel_id = channel, %scope, "mark_read outside a conversation channel");
                return;
            };
            if let Err(e) = conversations
                .mark_read(user.user_id, conversation_id, up_to)
                .await
            {
                warn!(channel_id = channel, conversation_id, error = %e, "mark_read from channel failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::ActorKind;
    use crate::test_support::TestWorld;

    fn user(user_id: i64, kind: ActorKind) -> AuthUser {
        AuthUser { user_id, kind }
    }

    #[tokio::test]
    async fn test_scope_resolution() {
        let w = TestWorld::new();
        let customer = w.customer();
        let worker = w.worker();
        let admin = w.admin();
        let stranger = w.customer();
        let conv = w.conversations.open(customer, vec![worker], None).await.unwrap();
        let c = user(customer, ActorKind::Customer);

        assert_eq!(
            resolve_scope(&w.accounts, &w.conversations, c, "notifications", None).await.unwrap(),
            Scope::UserNotifications(customer)
        );
        assert!(matches!(
            resolve_scope(&w.accounts, &w.conversations, c, "admin", None).await,
            Err(CoreError::Forbidden(_))
        ));
        assert_eq!(
            resolve_scope(&w.accounts, &w.conversations, user(admin, ActorKind::Admin), "monitor", None)
                .await
                .unwrap(),
            Scope::UserMonitor
        );
        assert_eq!(
            resolve_scope(&w.accounts, &w.conversations, c, "conversation", Some(conv.id))
                .await
                .unwrap(),
            Scope::Conversation(conv.id)
        );
        assert!(matches!(
            resolve_scope(
                &w.accounts,
                &w.conversations,
                user(stranger, ActorKind::Customer),
                "conversation",
                Some(conv.id)
            )
            .await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            resolve_scope(&w.accounts, &w.conversations, c, "conversation", None).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            resolve_scope(&w.accounts, &w.conversations, c, "firehose", None).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_client_frames() {
        let w = TestWorld::new();
        let customer = w.customer();
        let worker = w.worker();
        let conv = w.conversations.open(customer, vec![worker], None).await.unwrap();
        let msg = w.conversations.send_message(worker, conv.id, "hello").await.unwrap();

        let scope = Scope::Conversation(conv.id);
        let mut reg = w.hub.register(customer, scope);
        let c = user(customer, ActorKind::Customer);

        handle_client_frame(&w.hub, &w.conversations, c, scope, reg.id, r#"{"type":"ping"}"#).await;
        assert_eq!(reg.rx.try_recv().unwrap(), ChannelEvent::Pong);

        let frame = format!(r#"{{"type":"mark_read","up_to":{}}}"#, msg.id);
        handle_client_frame(&w.hub, &w.conversations, c, scope, reg.id, &frame).await;
        assert!(matches!(
            reg.rx.try_recv().unwrap(),
            ChannelEvent::MessagesRead { reader_id, .. } if reader_id == customer
        ));
        assert_eq!(w.conversations.unread_count(customer, conv.id).await.unwrap(), 0);

        handle_client_frame(&w.hub, &w.conversations, c, scope, reg.id, "garbage").await;
        assert!(reg.rx.try_recv().is_err());
    }
}

//! Conversation Service
//!
//! Messages are persisted first, then fanned out to the conversation's
//! live channels and the admin user monitor. Participants with no open
//! channel get a notification instead.

use serde_json::json;
use std::sync::Arc;

use super::db::ConversationStore;
use super::types::{Conversation, HistoryQuery, MAX_MESSAGE_CHARS, Message, NewConversation};
use crate::account::AccountService;
use crate::core_types::{BookingId, ConversationId, MessageId, UserId};
use crate::env::Environment;
use crate::error::{CoreError, CoreResult};
use crate::notifications::{NewNotification, NotificationKind, NotificationService};
use crate::presence::{ChannelEvent, PresenceHub, Scope};

pub struct ConversationService {
    env: Environment,
    store: Arc<dyn ConversationStore>,
    accounts: Arc<AccountService>,
    notifications: Arc<NotificationService>,
}

impl ConversationService {
    pub fn new(
        env: Environment,
        store: Arc<dyn ConversationStore>,
        accounts: Arc<AccountService>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            env,
            store,
            accounts,
            notifications,
        }
    }

    fn hub(&self) -> &Arc<PresenceHub> {
        self.notifications.hub()
    }

    async fn load(&self, id: ConversationId) -> CoreResult<Conversation> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("conversation {}", id)))
    }

    /// Start a conversation. The creator is always a participant.
    pub async fn open(
        &self,
        created_by: UserId,
        mut participants: Vec<UserId>,
        booking_id: Option<BookingId>,
    ) -> CoreResult<Conversation> {
        self.accounts.actor(created_by).await?;
        participants.push(created_by);
        participants.sort_unstable();
        participants.dedup();
        if participants.len() < 2 {
            return Err(CoreError::validation("a conversation needs two participants"));
        }
        for &user_id in &participants {
            self.accounts.actor(user_id).await?;
        }
        let conversation = self
            .store
            .create_conversation(
                NewConversation {
                    booking_id,
                    participants,
                    created_by,
                },
                self.env.now(),
            )
            .await?;
        tracing::info!(
            conversation_id = conversation.id,
            created_by,
            participants = ?conversation.participants,
            "Conversation opened"
        );
        Ok(conversation)
    }

    /// Who may subscribe to a conversation channel: its participants, and
    /// admins for oversight.
    pub async fn authorize_channel(&self, user_id: UserId, id: ConversationId) -> CoreResult<Conversation> {
        let conversation = self.load(id).await?;
        if conversation.is_closed() {
            return Err(CoreError::conflict(format!("conversation {} is closed", id)));
        }
        if conversation.is_participant(user_id) || self.accounts.actor(user_id).await?.is_admin() {
            return Ok(conversation);
        }
        Err(CoreError::forbidden(format!(
            "user {} is not in conversation {}",
            user_id, id
        )))
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        id: ConversationId,
        content: &str,
    ) -> CoreResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CoreError::validation("message is empty"));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(CoreError::validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        let conversation = self.load(id).await?;
        if !conversation.is_participant(sender_id) {
            return Err(CoreError::forbidden(format!(
                "user {} is not in conversation {}",
                sender_id, id
            )));
        }
        let message = self
            .store
            .insert_message(id, sender_id, content, self.env.now())
            .await?;

        let event = ChannelEvent::NewMessage {
            conversation_id: id,
            message: message.frame(),
        };
        let live = self.hub().broadcast(Scope::Conversation(id), event.clone());
        self.hub().broadcast(Scope::UserMonitor, event);
        tracing::debug!(conversation_id = id, message_id = message.id, live, "Message sent");

        let preview: String = content.chars().take(80).collect();
        let offline = conversation
            .participants
            .iter()
            .copied()
            .filter(|&p| p != sender_id && !self.hub().is_online(p))
            .map(|p| {
                NewNotification::new(p, NotificationKind::NewMessage, "New message", preview.clone())
                    .with_data(json!({
                        "conversation_id": id,
                        "message_id": message.id,
                    }))
            })
            .collect();
        self.notifications.create_many(offline).await;
        Ok(message)
    }

    /// Move the caller's read marker and tell the other channels.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        id: ConversationId,
        up_to: MessageId,
    ) -> CoreResult<MessageId> {
        let conversation = self.load(id).await?;
        if !conversation.is_participant(user_id) {
            return Err(CoreError::forbidden(format!(
                "user {} is not in conversation {}",
                user_id, id
            )));
        }
        let marker = self
            .store
            .mark_read(id, user_id, up_to, self.env.now())
            .await?;
        self.hub().broadcast(
            Scope::Conversation(id),
            ChannelEvent::MessagesRead {
                conversation_id: id,
                reader_id: user_id,
                up_to: marker,
            },
        );
        Ok(marker)
    }

    pub async fn unread_count(&self, user_id: UserId, id: ConversationId) -> CoreResult<i64> {
        self.store.unread_count(id, user_id).await
    }

    pub async fn history(
        &self,
        user_id: UserId,
        id: ConversationId,
        query: HistoryQuery,
    ) -> CoreResult<Vec<Message>> {
        if query.limit <= 0 || query.limit > 200 {
            return Err(CoreError::validation("limit must be between 1 and 200"));
        }
        let conversation = self.load(id).await?;
        if !conversation.is_participant(user_id) && !self.accounts.actor(user_id).await?.is_admin() {
            return Err(CoreError::forbidden(format!(
                "user {} is not in conversation {}",
                user_id, id
            )));
        }
        self.store.messages(id, query).await
    }

    /// Close the conversation and every channel subscribed to it.
    pub async fn close(&self, user_id: UserId, id: ConversationId) -> CoreResult<Conversation> {
        let conversation = self.load(id).await?;
        if !conversation.is_participant(user_id) && !self.accounts.actor(user_id).await?.is_admin() {
            return Err(CoreError::forbidden(format!(
                "user {} cannot close conversation {}",
                user_id, id
            )));
        }
        let closed = self
            .store
            .close_conversation(id, self.env.now())
            .await?
            .ok_or_else(|| CoreError::not_found(format!("conversation {}", id)))?;
        let dropped = self.hub().close_scope(Scope::Conversation(id));
        tracing::info!(conversation_id = id, closed_by = user_id, dropped, "Conversation closed");
        Ok(closed)
    }
}

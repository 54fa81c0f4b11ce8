//! Conversation persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::types::{Conversation, HistoryQuery, Message, NewConversation};
use crate::core_types::{ConversationId, MessageId, UserId};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        new: NewConversation,
        now: DateTime<Utc>,
    ) -> CoreResult<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>>;

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Message>;

    /// Newest first.
    async fn messages(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> CoreResult<Vec<Message>>;

    /// Moves the participant's read marker forward, never back. Returns the
    /// marker after the update.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        up_to: MessageId,
        now: DateTime<Utc>,
    ) -> CoreResult<MessageId>;

    /// Messages from others after the participant's read marker.
    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> CoreResult<i64>;

    /// Sets `closed_at` once. Returns the row as it stands.
    async fn close_conversation(
        &self,
        id: ConversationId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Conversation>>;
}

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CONVERSATION_SELECT: &str = r#"SELECT c.id, c.booking_id, c.created_by, c.created_at, c.closed_at,
       COALESCE(ARRAY(SELECT p.user_id FROM conversation_participants_tb p
                      WHERE p.conversation_id = c.id ORDER BY p.user_id), '{}') AS participants
FROM conversations_tb c"#;

fn conversation_from_row(row: &PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        booking_id: row.get("booking_id"),
        participants: row.get("participants"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        sent_at: row.get("sent_at"),
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create_conversation(
        &self,
        new: NewConversation,
        now: DateTime<Utc>,
    ) -> CoreResult<Conversation> {
        let mut tx = self.pool.begin().await?;
        let id: ConversationId = sqlx::query_scalar(
            r#"INSERT INTO conversations_tb (booking_id, created_by, created_at)
               VALUES ($1, $2, $3) RETURNING id"#,
        )
        .bind(new.booking_id)
        .bind(new.created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        for user_id in &new.participants {
            sqlx::query(
                r#"INSERT INTO conversation_participants_tb (conversation_id, user_id, last_read_message_id, joined_at)
                   VALUES ($1, $2, 0, $3)"#,
            )
            .bind(id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        let row = sqlx::query(&format!("{} WHERE c.id = $1", CONVERSATION_SELECT))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(conversation_from_row(&row))
    }

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!("{} WHERE c.id = $1", CONVERSATION_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        // serializes against close
        let closed: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT closed_at FROM conversations_tb WHERE id = $1 FOR UPDATE")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await?;
        match closed {
            None => {
                return Err(CoreError::not_found(format!("conversation {}", conversation_id)));
            }
            Some(Some(_)) => {
                return Err(CoreError::conflict(format!(
                    "conversation {} is closed",
                    conversation_id
                )));
            }
            Some(None) => {}
        }
        let row = sqlx::query(
            r#"INSERT INTO conversation_messages_tb (conversation_id, sender_id, content, sent_at)
               VALUES ($1, $2, $3, $4)
               RETURNING id, conversation_id, sender_id, content, sent_at"#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(message_from_row(&row))
    }

    async fn messages(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"SELECT id, conversation_id, sender_id, content, sent_at
               FROM conversation_messages_tb
               WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR id < $2)
               ORDER BY id DESC
               LIMIT $3"#,
        )
        .bind(conversation_id)
        .bind(query.before)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        up_to: MessageId,
        now: DateTime<Utc>,
    ) -> CoreResult<MessageId> {
        let marker: Option<MessageId> = sqlx::query_scalar(
            r#"UPDATE conversation_participants_tb
               SET last_read_message_id = GREATEST(last_read_message_id, $3), last_read_at = $4
               WHERE conversation_id = $1 AND user_id = $2
               RETURNING last_read_message_id"#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(up_to)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        marker.ok_or_else(|| {
            CoreError::forbidden(format!(
                "user {} is not in conversation {}",
                user_id, conversation_id
            ))
        })
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM conversation_messages_tb m
               JOIN conversation_participants_tb p
                 ON p.conversation_id = m.conversation_id AND p.user_id = $2
               WHERE m.conversation_id = $1 AND m.sender_id <> $2
                 AND m.id > p.last_read_message_id"#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn close_conversation(
        &self,
        id: ConversationId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Conversation>> {
        sqlx::query("UPDATE conversations_tb SET closed_at = $1 WHERE id = $2 AND closed_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_conversation(id).await
    }
}

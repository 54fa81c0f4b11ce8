//! Conversation Types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core_types::{BookingId, ConversationId, MessageId, UserId};
use crate::presence::MessageFrame;

/// Longest message body accepted, in characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Booking the thread is about, if any
    pub booking_id: Option<BookingId>,
    pub participants: Vec<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn frame(&self) -> MessageFrame {
        MessageFrame {
            id: self.id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            sent_at: self.sent_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub booking_id: Option<BookingId>,
    pub participants: Vec<UserId>,
    pub created_by: UserId,
}

/// Page of history, newest first
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryQuery {
    pub before: Option<MessageId>,
    pub limit: i64,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            before: None,
            limit: 50,
        }
    }
}

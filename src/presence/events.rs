//! Channel event frames
//!
//! Every frame is a JSON object tagged by `type`. Clients must tolerate
//! duplicates; notification frames carry the notification id for that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{BookingId, ConversationId, MessageId, NotificationId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationFrame {
    pub id: NotificationId,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageFrame {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Server -> client frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    Connected {
        user_id: UserId,
        scope: String,
    },
    NewNotification {
        notification: NotificationFrame,
        unread_count: i64,
    },
    UnreadCountUpdate {
        unread_count: i64,
    },
    NewMessage {
        conversation_id: ConversationId,
        message: MessageFrame,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
    },
    BookingUpdate {
        booking_id: BookingId,
        reference: String,
        state: String,
    },
    /// Admin user monitor: an actor's first channel opened or last one closed
    Presence {
        user_id: UserId,
        online: bool,
    },
    Pong,
}

impl ChannelEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelEvent::Connected { .. } => "connected",
            ChannelEvent::NewNotification { .. } => "new_notification",
            ChannelEvent::UnreadCountUpdate { .. } => "unread_count_update",
            ChannelEvent::NewMessage { .. } => "new_message",
            ChannelEvent::MessagesRead { .. } => "messages_read",
            ChannelEvent::BookingUpdate { .. } => "booking_update",
            ChannelEvent::Presence { .. } => "presence",
            ChannelEvent::Pong => "pong",
        }
    }
}

/// Client -> server frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    /// Conversation channels: mark read up to a message
    MarkRead { up_to: MessageId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let json = serde_json::to_value(ChannelEvent::UnreadCountUpdate { unread_count: 3 }).unwrap();
        assert_eq!(json["type"], "unread_count_update");
        assert_eq!(json["unread_count"], 3);

        let json = serde_json::to_value(ChannelEvent::Pong).unwrap();
        assert_eq!(json["type"], ChannelEvent::Pong.type_name());
    }

    #[test]
    fn test_client_frame_parse() {
        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
        let read: ClientFrame = serde_json::from_str(r#"{"type":"mark_read","up_to":7}"#).unwrap();
        assert_eq!(read, ClientFrame::MarkRead { up_to: 7 });
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shout"}"#).is_err());
    }
}

//! Conversations between customers, workers and admins.

pub mod db;
pub mod service;
pub mod types;

pub use db::{ConversationStore, PgConversationStore};
pub use service::ConversationService;
pub use types::{Conversation, HistoryQuery, MAX_MESSAGE_CHARS, Message, NewConversation};

//! Notifications
//!
//! Durable in-app notifications, unread counters, live fan-out through the
//! presence hub and best-effort device push.

pub mod db;
pub mod dispatcher;
pub mod push;
pub mod service;
pub mod types;

pub use db::{NotificationStore, PgNotificationStore};
pub use dispatcher::{DispatchStats, DispatcherConfig, PushDispatcher, PushJob};
pub use push::{FcmClient, FcmConfig, PushError, PushMessage, PushProvider};
pub use service::NotificationService;
pub use types::{DeviceToken, ListQuery, NewNotification, Notification, NotificationKind};

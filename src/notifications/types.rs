//! Notification Types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::core_types::{NotificationId, UserId};
use crate::presence::NotificationFrame;

/// Kinds raised by the core. Collaborators may store other kinds; the
/// column is free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    BookingCreated,
    BookingConfirmed,
    BookingCancelled,
    BookingExpired,
    HoldExpiredRefunded,
    InquiryReceived,
    QuoteProvided,
    QuoteAccepted,
    QuoteRejected,
    QuoteExpired,
    WorkerAssigned,
    AssignmentAccepted,
    AssignmentRejected,
    WorkStarted,
    WorkCompleted,
    PaymentRefunded,
    WithdrawalRequested,
    WithdrawalApproved,
    WithdrawalRejected,
    WithdrawalReminder,
    NewMessage,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "booking_created",
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::BookingExpired => "booking_expired",
            NotificationKind::HoldExpiredRefunded => "hold_expired_refunded",
            NotificationKind::InquiryReceived => "inquiry_received",
            NotificationKind::QuoteProvided => "quote_provided",
            NotificationKind::QuoteAccepted => "quote_accepted",
            NotificationKind::QuoteRejected => "quote_rejected",
            NotificationKind::QuoteExpired => "quote_expired",
            NotificationKind::WorkerAssigned => "worker_assigned",
            NotificationKind::AssignmentAccepted => "assignment_accepted",
            NotificationKind::AssignmentRejected => "assignment_rejected",
            NotificationKind::WorkStarted => "work_started",
            NotificationKind::WorkCompleted => "work_completed",
            NotificationKind::PaymentRefunded => "payment_refunded",
            NotificationKind::WithdrawalRequested => "withdrawal_requested",
            NotificationKind::WithdrawalApproved => "withdrawal_approved",
            NotificationKind::WithdrawalRejected => "withdrawal_rejected",
            NotificationKind::WithdrawalReminder => "withdrawal_reminder",
            NotificationKind::NewMessage => "new_message",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn frame(&self) -> NotificationFrame {
        NotificationFrame {
            id: self.id,
            kind: self.kind.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

impl NewNotification {
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            kind: kind.as_str().to_string(),
            title: title.into(),
            body: body.into(),
            data: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceToken {
    pub id: i64,
    pub user_id: UserId,
    pub token: String,
    pub platform: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Listing filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub unread_only: bool,
    /// Only ids strictly below this (keyset pagination)
    pub before_id: Option<NotificationId>,
    pub limit: i64,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            unread_only: false,
            before_id: None,
            limit: 50,
        }
    }
}

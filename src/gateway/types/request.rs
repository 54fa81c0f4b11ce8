//! Request DTOs and the validating JSON extractor
//!
//! Handlers never see a body that failed shape or range checks; domain
//! rules (state machine, ownership, funds) stay in the services.

use axum::{
    Json,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError};

use super::response::{ApiResponse, error_codes};
use crate::core_types::{BookingId, MessageId, NotificationId, PlanId, UserId};
use crate::payments::PaymentMethod;

// ============================================================================
// ValidatedJson: Axum Framework Integration
// ============================================================================

/// JSON body that passed `validator` checks.
#[derive(Debug)]
pub struct ValidatedJson<T>(pub T);

pub struct ValidationRejection {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ValidationRejection {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(
            error_codes::INVALID_PARAMETER,
            self.message,
        ));
        (self.status, body).into_response()
    }
}

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ValidationRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value): Json<T> =
            Json::from_request(req, state)
                .await
                .map_err(|e| ValidationRejection {
                    status: StatusCode::BAD_REQUEST,
                    message: format!("Invalid JSON: {}", e.body_text()),
                })?;
        value.validate().map_err(|e| ValidationRejection {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        })?;
        Ok(ValidatedJson(value))
    }
}

fn positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_positive() && !value.is_zero() {
        Ok(())
    } else {
        Err(ValidationError::new("amount_not_positive"))
    }
}

fn non_zero_amount(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_zero() {
        Err(ValidationError::new("amount_zero"))
    } else {
        Ok(())
    }
}

fn client_payment_method(value: &str) -> Result<(), ValidationError> {
    match value.parse::<PaymentMethod>() {
        Ok(PaymentMethod::Gateway | PaymentMethod::Wallet) => Ok(()),
        _ => Err(ValidationError::new("unsupported_payment_method")),
    }
}

/// Parse a method string that already passed [`client_payment_method`].
pub fn parse_method(value: &str) -> PaymentMethod {
    value.parse().unwrap_or(PaymentMethod::Gateway)
}

// ============================================================================
// Bookings
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    #[validate(range(min = 1))]
    pub service_id: i64,
    /// Required for fixed-price services
    pub slot_start: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub address_id: i64,
    #[validate(custom(function = "client_payment_method"))]
    pub method: String,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// Gateway checkout proof
#[derive(Debug, Deserialize, Validate)]
pub struct PaymentProofRequest {
    #[validate(length(min = 1, max = 64))]
    pub gateway_payment_id: String,
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct QuoteRequest {
    #[validate(custom(function = "positive_amount"))]
    pub amount: Decimal,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(range(min = 1, max = 720))]
    pub ttl_hours: Option<i64>,
    #[validate(range(min = 15, max = 1440))]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReasonRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ScheduleRequest {
    pub slot_start: DateTime<Utc>,
    #[validate(custom(function = "client_payment_method"))]
    pub method: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AssignWorkerRequest {
    #[validate(range(min = 1))]
    pub worker_id: UserId,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartWorkRequest {
    #[validate(length(min = 1, max = 1000))]
    pub notes: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompleteWorkRequest {
    #[validate(length(min = 1, max = 2000))]
    pub notes: String,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub materials_used: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub photos: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlotsParams {
    pub service_id: i64,
    /// Business-local date
    pub date: NaiveDate,
}

// ============================================================================
// Payments and wallet
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 32))]
    pub kind: String,
    #[validate(custom(function = "client_payment_method"))]
    pub method: String,
    #[validate(custom(function = "positive_amount"))]
    pub amount: Decimal,
    pub plan_id: Option<PlanId>,
    pub booking_id: Option<BookingId>,
    #[validate(length(max = 500))]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    /// Full amount when absent
    #[validate(custom(function = "positive_amount"))]
    pub amount: Option<Decimal>,
    #[validate(length(min = 1, max = 500))]
    pub notes: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustRequest {
    #[validate(range(min = 1))]
    pub user_id: UserId,
    /// Signed: credits are positive, debits negative
    #[validate(custom(function = "non_zero_amount"))]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawalRequest {
    #[validate(custom(function = "positive_amount"))]
    pub amount: Decimal,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

// ============================================================================
// Notifications and conversations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NotificationListParams {
    #[serde(default)]
    pub unread_only: bool,
    pub before_id: Option<NotificationId>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeviceRequest {
    #[validate(length(min = 1, max = 4096))]
    pub token: String,
    #[validate(length(min = 1, max = 16))]
    pub platform: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OpenConversationRequest {
    #[validate(length(min = 1, max = 10))]
    pub participants: Vec<UserId>,
    pub booking_id: Option<BookingId>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1))]
    pub content: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MarkReadRequest {
    #[validate(range(min = 0))]
    pub up_to: MessageId,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub before: Option<MessageId>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

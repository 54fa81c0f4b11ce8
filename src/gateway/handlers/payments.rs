//! Payment, wallet and webhook handlers

use std::sync::Arc;

use axum::{
    Extension,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use rust_decimal::Decimal;
use serde::Serialize;

use super::super::state::AppState;
use super::super::types::request::{
    AdjustRequest, CreateOrderRequest, ListParams, PaymentProofRequest, RangeParams,
    ReasonRequest, RefundRequest, WithdrawalRequest,
};
use super::super::types::{ApiResult, ValidatedJson, ok, parse_method};
use crate::auth::AuthUser;
use crate::core_types::{PaymentId, UserId};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{LedgerEntry, LedgerSummary};
use crate::payments::{
    CreateOrder, OrderCreated, Payment, PaymentKind, PaymentRelation, RefundResult,
    WebhookOutcome,
};

/// Header carrying the gateway's webhook HMAC
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-razorpay-signature";

fn order_from_request(user_id: UserId, req: CreateOrderRequest) -> CoreResult<CreateOrder> {
    let kind: PaymentKind = req.kind.parse().map_err(CoreError::Validation)?;
    let relation = match (req.plan_id, req.booking_id) {
        (Some(_), Some(_)) => {
            return Err(CoreError::validation(
                "an order pays for a plan or a booking, not both",
            ));
        }
        (Some(plan), None) => Some(PaymentRelation::SubscriptionPlan(plan)),
        (None, Some(booking)) => Some(PaymentRelation::Booking(booking)),
        (None, None) => None,
    };
    Ok(CreateOrder {
        user_id,
        kind,
        method: parse_method(&req.method),
        amount: req.amount,
        relation,
        description: req.description,
    })
}

pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<CreateOrderRequest>,
) -> ApiResult<OrderCreated> {
    let order = order_from_request(user.user_id, req)?;
    ok(state.payments.create_order(order).await?)
}

pub async fn verify_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
    ValidatedJson(req): ValidatedJson<PaymentProofRequest>,
) -> ApiResult<Payment> {
    state.payments.get_for(user.user_id, id).await?;
    ok(state
        .payments
        .verify_and_complete(id, &req.gateway_payment_id, &req.signature)
        .await?)
}

pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
) -> ApiResult<Payment> {
    ok(state.payments.cancel(id, user.user_id).await?)
}

pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
) -> ApiResult<Payment> {
    ok(state.payments.get_for(user.user_id, id).await?)
}

pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Payment>> {
    ok(state
        .payments
        .list_for_user(user.user_id, params.limit.unwrap_or(50))
        .await?)
}

pub async fn refund_payment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
    ValidatedJson(req): ValidatedJson<RefundRequest>,
) -> ApiResult<RefundResult> {
    state.accounts.require_admin(user.user_id).await?;
    tracing::info!(target: "AUDIT", admin_id = user.user_id, payment_id = id, "Refund requested");
    ok(state.payments.refund(id, req.amount, &req.notes).await?)
}

pub async fn adjust_wallet(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<AdjustRequest>,
) -> ApiResult<Payment> {
    ok(state
        .payments
        .admin_adjust(user.user_id, req.user_id, req.amount, &req.reason)
        .await?)
}

// ============================================================================
// Withdrawals
// ============================================================================

pub async fn request_withdrawal(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<WithdrawalRequest>,
) -> ApiResult<Payment> {
    ok(state
        .payments
        .withdrawal_request(user.user_id, req.amount, req.notes)
        .await?)
}

pub async fn approve_withdrawal(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
) -> ApiResult<Payment> {
    ok(state.payments.withdrawal_approve(user.user_id, id).await?)
}

pub async fn reject_withdrawal(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<PaymentId>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> ApiResult<Payment> {
    ok(state
        .payments
        .withdrawal_reject(user.user_id, id, &req.reason)
        .await?)
}

// ============================================================================
// Wallet
// ============================================================================

#[derive(Debug, Serialize)]
pub struct BalanceData {
    pub user_id: UserId,
    pub balance: Decimal,
}

pub async fn wallet_balance(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<BalanceData> {
    let balance = state.ledger.balance(user.user_id).await?;
    ok(BalanceData {
        user_id: user.user_id,
        balance,
    })
}

pub async fn wallet_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(range): Query<RangeParams>,
) -> ApiResult<Vec<LedgerEntry>> {
    ok(state
        .ledger
        .history(user.user_id, range.from, range.to)
        .await?)
}

pub async fn wallet_summary(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(range): Query<RangeParams>,
) -> ApiResult<LedgerSummary> {
    ok(state
        .ledger
        .summary(user.user_id, range.from, range.to)
        .await?)
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<PaymentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Processed(id) => Self {
                status: "processed",
                payment_id: Some(id),
                detail: None,
            },
            WebhookOutcome::Duplicate => Self {
                status: "duplicate",
                payment_id: None,
                detail: None,
            },
            WebhookOutcome::Ignored(why) => Self {
                status: "ignored",
                payment_id: None,
                detail: Some(why),
            },
        }
    }
}

/// Unauthenticated; trust comes from the body HMAC.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(CoreError::SignatureMismatch)?;
    let outcome = state.payments.handle_webhook(&body, signature).await?;
    ok(outcome.into())
}

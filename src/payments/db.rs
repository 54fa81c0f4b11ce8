//! Payment persistence
//!
//! Status changes are compare-and-set under `SELECT ... FOR UPDATE`; the
//! ledger entries and companion rows they carry commit in the same
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;

use super::types::{
    AppliedTransition, NewPayment, Payment, PaymentKind, PaymentMethod, PaymentStatus,
    PaymentRelation, PaymentTransition, TransitionOutcome,
};
use crate::core_types::{CURRENCY_INR, PaymentId, UserId};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{LedgerDraft, LedgerEntry, append_entry_tx};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a payment plus ledger entries caused by it. Entries without a
    /// cause are linked to the new payment.
    async fn insert(
        &self,
        payment: NewPayment,
        entries: Vec<LedgerDraft>,
        now: DateTime<Utc>,
    ) -> CoreResult<(Payment, Vec<LedgerEntry>)>;

    async fn get(&self, id: PaymentId) -> CoreResult<Option<Payment>>;

    async fn get_by_order_id(&self, order_id: &str) -> CoreResult<Option<Payment>>;

    async fn set_gateway_order(
        &self,
        id: PaymentId,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn transition(
        &self,
        transition: PaymentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<TransitionOutcome>;

    /// Newest first.
    async fn list_for_user(&self, user_id: UserId, limit: i64) -> CoreResult<Vec<Payment>>;

    async fn webhook_event_seen(&self, event_kind: &str, gateway_payment_id: &str)
    -> CoreResult<bool>;

    /// Returns false if the event was already recorded.
    async fn record_webhook_event(
        &self,
        event_kind: &str,
        gateway_payment_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;

    async fn pending_withdrawals_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<Payment>>;

    /// Gateway checkouts still `pending` that were opened before `cutoff`,
    /// oldest first.
    async fn pending_gateway_payments_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Payment>>;
}

pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PAYMENT_COLUMNS: &str = "id, reference, user_id, amount, currency, kind, method, status, \
     gateway_order_id, gateway_payment_id, related_entity_kind, related_entity_id, notes, \
     created_at, updated_at";

fn payment_from_row(row: &PgRow) -> CoreResult<Payment> {
    Ok(Payment {
        id: row.get("id"),
        reference: row.get("reference"),
        user_id: row.get("user_id"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        kind: PaymentKind::from_str(row.get::<&str, _>("kind")).map_err(CoreError::Internal)?,
        method: PaymentMethod::from_str(row.get::<&str, _>("method"))
            .map_err(CoreError::Internal)?,
        status: PaymentStatus::from_str(row.get::<&str, _>("status"))
            .map_err(CoreError::Internal)?,
        gateway_order_id: row.get("gateway_order_id"),
        gateway_payment_id: row.get("gateway_payment_id"),
        relation: PaymentRelation::from_parts(
            row.get::<Option<&str>, _>("related_entity_kind"),
            row.get("related_entity_id"),
        ),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn insert_payment_tx(
    conn: &mut PgConnection,
    p: &NewPayment,
    now: DateTime<Utc>,
) -> CoreResult<Payment> {
    let row = sqlx::query(&format!(
        r#"INSERT INTO payments_tb
               (reference, user_id, amount, currency, kind, method, status,
                related_entity_kind, related_entity_id, notes, created_at, updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
           RETURNING {}"#,
        PAYMENT_COLUMNS
    ))
    .bind(&p.reference)
    .bind(p.user_id)
    .bind(p.amount)
    .bind(CURRENCY_INR)
    .bind(p.kind.as_str())
    .bind(p.method.as_str())
    .bind(p.status.as_str())
    .bind(p.relation.map(|r| r.kind_str()))
    .bind(p.relation.map(|r| r.id()))
    .bind(&p.notes)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    payment_from_row(&row)
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(
        &self,
        payment: NewPayment,
        entries: Vec<LedgerDraft>,
        now: DateTime<Utc>,
    ) -> CoreResult<(Payment, Vec<LedgerEntry>)> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_payment_tx(&mut tx, &payment, now).await?;
        let mut written = Vec::with_capacity(entries.len());
        for draft in entries {
            let draft = match draft.cause_payment_id {
                Some(_) => draft,
                None => draft.caused_by(inserted.id),
            };
            written.push(append_entry_tx(&mut tx, &draft, now).await?);
        }
        tx.commit().await?;
        Ok((inserted, written))
    }

    async fn get(&self, id: PaymentId) -> CoreResult<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payments_tb WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn get_by_order_id(&self, order_id: &str) -> CoreResult<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payments_tb WHERE gateway_order_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn set_gateway_order(
        &self,
        id: PaymentId,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE payments_tb SET gateway_order_id = $1, updated_at = $2 WHERE id = $3 AND status = 'pending'",
        )
        .bind(order_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        t: PaymentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM payments_tb WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(t.payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("payment {}", t.payment_id)))?;
        let current = payment_from_row(&row)?;
        if current.status != t.from {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Stale(current));
        }

        let row = sqlx::query(&format!(
            r#"UPDATE payments_tb
               SET status = $1,
                   gateway_payment_id = COALESCE($2, gateway_payment_id),
                   notes = COALESCE($3, notes),
                   updated_at = $4
               WHERE id = $5
               RETURNING {}"#,
            PAYMENT_COLUMNS
        ))
        .bind(t.to.as_str())
        .bind(&t.gateway_payment_id)
        .bind(&t.notes)
        .bind(now)
        .bind(t.payment_id)
        .fetch_one(&mut *tx)
        .await?;
        let payment = payment_from_row(&row)?;

        let companion = match &t.companion {
            Some(c) => Some(insert_payment_tx(&mut tx, c, now).await?),
            None => None,
        };

        let mut entries = Vec::with_capacity(t.entries.len());
        for draft in &t.entries {
            entries.push(append_entry_tx(&mut tx, draft, now).await?);
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied(AppliedTransition {
            payment,
            companion,
            entries,
        }))
    }

    async fn list_for_user(&self, user_id: UserId, limit: i64) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payments_tb WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn webhook_event_seen(
        &self,
        event_kind: &str,
        gateway_payment_id: &str,
    ) -> CoreResult<bool> {
        let seen: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM webhook_events_tb WHERE event_kind = $1 AND gateway_payment_id = $2)",
        )
        .bind(event_kind)
        .bind(gateway_payment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(seen)
    }

    async fn record_webhook_event(
        &self,
        event_kind: &str,
        gateway_payment_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO webhook_events_tb (event_kind, gateway_payment_id, processed_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (event_kind, gateway_payment_id) DO NOTHING"#,
        )
        .bind(event_kind)
        .bind(gateway_payment_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_withdrawals_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM payments_tb
               WHERE kind = 'withdrawal' AND status = 'pending' AND created_at <= $1
               ORDER BY created_at ASC"#,
            PAYMENT_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn pending_gateway_payments_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM payments_tb
               WHERE method = 'gateway' AND status = 'pending' AND created_at <= $1
               ORDER BY created_at ASC
               LIMIT $2"#,
            PAYMENT_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }
}

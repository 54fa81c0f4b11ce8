//! Ledger persistence
//!
//! Appends lock the owning actor row (`FOR UPDATE`) so concurrent writers
//! on one wallet serialize, then move the `is_latest` chain head and the
//! cached `wallet_balance` together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;

use super::types::{EntryKind, LedgerDraft, LedgerEntry, next_link};
use crate::core_types::UserId;
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one entry in its own transaction.
    async fn append(&self, draft: LedgerDraft, now: DateTime<Utc>) -> CoreResult<LedgerEntry>;

    async fn latest(&self, user_id: UserId) -> CoreResult<Option<LedgerEntry>>;

    /// Entries in chain order, optionally bounded by `[from, to)`.
    async fn entries(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<LedgerEntry>>;

    /// `Actor.wallet_balance`
    async fn cached_balance(&self, user_id: UserId) -> CoreResult<Decimal>;

    /// Users that own a wallet (reconciliation sweep).
    async fn wallet_users(&self) -> CoreResult<Vec<UserId>>;
}

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ENTRY_COLUMNS: &str =
    "id, user_id, amount, cause_payment_id, prev_balance, new_balance, kind, created_at";

fn entry_from_row(row: &PgRow) -> CoreResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get("id"),
        user_id: row.get("user_id"),
        amount: row.get("amount"),
        cause_payment_id: row.get("cause_payment_id"),
        prev_balance: row.get("prev_balance"),
        new_balance: row.get("new_balance"),
        kind: EntryKind::from_str(row.get::<&str, _>("kind")).map_err(CoreError::Internal)?,
        created_at: row.get("created_at"),
    })
}

/// Append `draft` inside an open transaction.
///
/// Callers that also write a payment row pass the same connection so the
/// payment and its entries commit together.
pub async fn append_entry_tx(
    conn: &mut PgConnection,
    draft: &LedgerDraft,
    now: DateTime<Utc>,
) -> CoreResult<LedgerEntry> {
    let cached: Decimal =
        sqlx::query_scalar("SELECT wallet_balance FROM actors_tb WHERE id = $1 FOR UPDATE")
            .bind(draft.user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("wallet of user {}", draft.user_id)))?;

    let head: Option<(i64, Decimal)> = sqlx::query_as(
        "SELECT id, new_balance FROM ledger_entries_tb WHERE user_id = $1 AND is_latest",
    )
    .bind(draft.user_id)
    .fetch_optional(&mut *conn)
    .await?;

    let link = next_link(head.map(|(_, b)| b).unwrap_or(Decimal::ZERO), cached, draft)?;

    if let Some((head_id, _)) = head {
        sqlx::query("UPDATE ledger_entries_tb SET is_latest = FALSE WHERE id = $1")
            .bind(head_id)
            .execute(&mut *conn)
            .await?;
    }

    let row = sqlx::query(&format!(
        r#"INSERT INTO ledger_entries_tb
               (user_id, amount, cause_payment_id, prev_balance, new_balance, kind, created_at, is_latest)
           VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
           RETURNING {}"#,
        ENTRY_COLUMNS
    ))
    .bind(draft.user_id)
    .bind(draft.amount)
    .bind(draft.cause_payment_id)
    .bind(link.prev_balance)
    .bind(link.new_balance)
    .bind(draft.kind.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE actors_tb SET wallet_balance = $1 WHERE id = $2")
        .bind(link.new_balance)
        .bind(draft.user_id)
        .execute(&mut *conn)
        .await?;

    let entry = entry_from_row(&row)?;
    tracing::debug!(
        user_id = entry.user_id,
        entry_id = entry.id,
        kind = %entry.kind,
        amount = %entry.amount,
        new_balance = %entry.new_balance,
        "Ledger entry appended"
    );
    Ok(entry)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, draft: LedgerDraft, now: DateTime<Utc>) -> CoreResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = append_entry_tx(&mut tx, &draft, now).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn latest(&self, user_id: UserId) -> CoreResult<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries_tb WHERE user_id = $1 AND is_latest",
            ENTRY_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn entries(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM ledger_entries_tb
               WHERE user_id = $1
                 AND ($2::timestamptz IS NULL OR created_at >= $2)
                 AND ($3::timestamptz IS NULL OR created_at < $3)
               ORDER BY id ASC"#,
            ENTRY_COLUMNS
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn cached_balance(&self, user_id: UserId) -> CoreResult<Decimal> {
        sqlx::query_scalar("SELECT wallet_balance FROM actors_tb WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("user {}", user_id)))
    }

    async fn wallet_users(&self) -> CoreResult<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"SELECT id FROM actors_tb
               WHERE wallet_balance <> 0
                  OR EXISTS (SELECT 1 FROM ledger_entries_tb l WHERE l.user_id = actors_tb.id)
               ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

//! Wallet ledger service

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::db::LedgerStore;
use super::types::{
    BalanceDrift, LedgerDraft, LedgerEntry, LedgerSummary, summarize, verify_chain,
};
use crate::core_types::{PaymentId, UserId};
use crate::env::Environment;
use crate::error::CoreResult;
use crate::money;

pub struct LedgerService {
    env: Environment,
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(env: Environment, store: Arc<dyn LedgerStore>) -> Self {
        Self { env, store }
    }

    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Decimal,
        cause: Option<PaymentId>,
    ) -> CoreResult<LedgerEntry> {
        let amount = money::normalize_positive(amount)?;
        self.append(LedgerDraft::credit(user_id, amount, cause)).await
    }

    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Decimal,
        cause: Option<PaymentId>,
    ) -> CoreResult<LedgerEntry> {
        let amount = money::normalize_positive(amount)?;
        self.append(LedgerDraft::debit(user_id, amount, cause)).await
    }

    pub async fn hold(
        &self,
        user_id: UserId,
        amount: Decimal,
        cause: Option<PaymentId>,
    ) -> CoreResult<LedgerEntry> {
        let amount = money::normalize_positive(amount)?;
        self.append(LedgerDraft::hold(user_id, amount, cause)).await
    }

    pub async fn release(
        &self,
        user_id: UserId,
        amount: Decimal,
        cause: Option<PaymentId>,
    ) -> CoreResult<LedgerEntry> {
        let amount = money::normalize_positive(amount)?;
        self.append(LedgerDraft::release(user_id, amount, cause)).await
    }

    pub async fn append(&self, draft: LedgerDraft) -> CoreResult<LedgerEntry> {
        self.store.append(draft, self.env.now()).await
    }

    /// Latest `new_balance`, zero for an empty chain.
    pub async fn balance(&self, user_id: UserId) -> CoreResult<Decimal> {
        Ok(self
            .store
            .latest(user_id)
            .await?
            .map(|e| e.new_balance)
            .unwrap_or(Decimal::ZERO))
    }

    pub async fn history(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<LedgerEntry>> {
        self.store.entries(user_id, from, to).await
    }

    pub async fn summary(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<LedgerSummary> {
        let entries = self.store.entries(user_id, from, to).await?;
        Ok(summarize(&entries))
    }

    /// Check one wallet: chain arithmetic and cached balance agreement.
    pub async fn reconcile(&self, user_id: UserId) -> CoreResult<Option<BalanceDrift>> {
        let entries = self.store.entries(user_id, None, None).await?;
        let cached = self.store.cached_balance(user_id).await?;
        let drift = match verify_chain(&entries) {
            Ok(chain_balance) if chain_balance == cached => None,
            Ok(chain_balance) => Some(BalanceDrift {
                user_id,
                cached_balance: cached,
                chain_balance: Some(chain_balance),
                detail: "cached wallet balance differs from ledger".to_string(),
            }),
            Err(brk) => Some(BalanceDrift {
                user_id,
                cached_balance: cached,
                chain_balance: None,
                detail: format!("chain broken at entry {}: {}", brk.entry_id, brk.reason),
            }),
        };
        if let Some(d) = &drift {
            tracing::error!(
                user_id,
                cached = %d.cached_balance,
                detail = %d.detail,
                "Wallet balance drift detected"
            );
        }
        Ok(drift)
    }

    /// Reconcile every wallet; drift is reported, never auto-corrected.
    pub async fn reconcile_all(&self) -> CoreResult<Vec<BalanceDrift>> {
        let mut drifts = Vec::new();
        for user_id in self.store.wallet_users().await? {
            if let Some(d) = self.reconcile(user_id).await? {
                drifts.push(d);
            }
        }
        tracing::info!(drift_count = drifts.len(), "Wallet reconciliation finished");
        Ok(drifts)
    }
}

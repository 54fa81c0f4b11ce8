//! Wallet Ledger Types
//!
//! A user's wallet is an append-only chain of entries. For every entry
//! `new_balance = prev_balance + amount`, each `prev_balance` equals the
//! previous entry's `new_balance`, and no entry ever goes below zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::core_types::{LedgerEntryId, PaymentId, UserId};
use crate::error::{CoreError, CoreResult};

/// Ledger entry kind. The kind fixes the sign of `amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Money in (recharge, refund)
    Credit,
    /// Money out (wallet payment, settled withdrawal)
    Debit,
    /// Funds frozen for a pending withdrawal
    Hold,
    /// Frozen funds returned
    Release,
    /// Manual admin correction, either sign
    Adjust,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
            EntryKind::Hold => "hold",
            EntryKind::Release => "release",
            EntryKind::Adjust => "adjust",
        }
    }

    /// Check that `amount` carries the sign this kind requires.
    pub fn check_sign(&self, amount: Decimal) -> CoreResult<()> {
        let ok = match self {
            EntryKind::Credit | EntryKind::Release => amount > Decimal::ZERO,
            EntryKind::Debit | EntryKind::Hold => amount < Decimal::ZERO,
            EntryKind::Adjust => !amount.is_zero(),
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::validation(format!(
                "{} entry cannot carry amount {}",
                self, amount
            )))
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(EntryKind::Credit),
            "debit" => Ok(EntryKind::Debit),
            "hold" => Ok(EntryKind::Hold),
            "release" => Ok(EntryKind::Release),
            "adjust" => Ok(EntryKind::Adjust),
            _ => Err(format!("Invalid ledger entry kind: {}", s)),
        }
    }
}

/// Immutable wallet ledger entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    /// Signed amount
    pub amount: Decimal,
    pub cause_payment_id: Option<PaymentId>,
    pub prev_balance: Decimal,
    pub new_balance: Decimal,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

/// An entry waiting to be appended. Amount is already signed.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDraft {
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub cause_payment_id: Option<PaymentId>,
}

impl LedgerDraft {
    pub fn credit(user_id: UserId, amount: Decimal, cause: Option<PaymentId>) -> Self {
        Self {
            user_id,
            amount: amount.abs(),
            kind: EntryKind::Credit,
            cause_payment_id: cause,
        }
    }

    pub fn debit(user_id: UserId, amount: Decimal, cause: Option<PaymentId>) -> Self {
        Self {
            user_id,
            amount: -amount.abs(),
            kind: EntryKind::Debit,
            cause_payment_id: cause,
        }
    }

    pub fn hold(user_id: UserId, amount: Decimal, cause: Option<PaymentId>) -> Self {
        Self {
            user_id,
            amount: -amount.abs(),
            kind: EntryKind::Hold,
            cause_payment_id: cause,
        }
    }

    pub fn release(user_id: UserId, amount: Decimal, cause: Option<PaymentId>) -> Self {
        Self {
            user_id,
            amount: amount.abs(),
            kind: EntryKind::Release,
            cause_payment_id: cause,
        }
    }

    /// Signed admin adjustment
    pub fn adjust(user_id: UserId, signed_amount: Decimal, cause: Option<PaymentId>) -> Self {
        Self {
            user_id,
            amount: signed_amount,
            kind: EntryKind::Adjust,
            cause_payment_id: cause,
        }
    }

    /// Attach the causing payment once its id is known.
    pub fn caused_by(mut self, payment_id: PaymentId) -> Self {
        self.cause_payment_id = Some(payment_id);
        self
    }
}

/// Balances computed for the next entry of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub prev_balance: Decimal,
    pub new_balance: Decimal,
}

/// Compute the next link of a user's chain.
///
/// `chain_head` is the latest entry's `new_balance` (zero for an empty
/// chain) and `cached_balance` is `Actor.wallet_balance`. Both are read under
/// the user row lock; a disagreement is a broken invariant.
pub fn next_link(
    chain_head: Decimal,
    cached_balance: Decimal,
    draft: &LedgerDraft,
) -> CoreResult<ChainLink> {
    if chain_head != cached_balance {
        tracing::error!(
            user_id = draft.user_id,
            chain_head = %chain_head,
            cached_balance = %cached_balance,
            "Ledger chain mismatch"
        );
        return Err(CoreError::internal(format!(
            "ledger chain mismatch for user {}: chain {} vs cached {}",
            draft.user_id, chain_head, cached_balance
        )));
    }

    draft.kind.check_sign(draft.amount)?;

    let new_balance = chain_head + draft.amount;
    if new_balance < Decimal::ZERO {
        return Err(CoreError::InsufficientFunds);
    }

    Ok(ChainLink {
        prev_balance: chain_head,
        new_balance,
    })
}

/// Where a chain stopped being consistent
#[derive(Debug, Clone, PartialEq)]
pub struct ChainBreak {
    pub entry_id: LedgerEntryId,
    pub reason: String,
}

/// Walk an ascending chain and return its final balance.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<Decimal, ChainBreak> {
    let mut running = Decimal::ZERO;
    for entry in entries {
        if entry.prev_balance != running {
            return Err(ChainBreak {
                entry_id: entry.id,
                reason: format!(
                    "prev_balance {} does not follow {}",
                    entry.prev_balance, running
                ),
            });
        }
        if entry.prev_balance + entry.amount != entry.new_balance {
            return Err(ChainBreak {
                entry_id: entry.id,
                reason: format!(
                    "{} + {} != {}",
                    entry.prev_balance, entry.amount, entry.new_balance
                ),
            });
        }
        if entry.new_balance < Decimal::ZERO {
            return Err(ChainBreak {
                entry_id: entry.id,
                reason: format!("negative balance {}", entry.new_balance),
            });
        }
        running = entry.new_balance;
    }
    Ok(running)
}

/// Totals by kind over a period
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub credits: Decimal,
    pub debits: Decimal,
    pub holds: Decimal,
    pub releases: Decimal,
    pub adjustments: Decimal,
    /// Sum of signed amounts
    pub net: Decimal,
    pub entry_count: usize,
}

pub fn summarize(entries: &[LedgerEntry]) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for entry in entries {
        match entry.kind {
            EntryKind::Credit => summary.credits += entry.amount,
            EntryKind::Debit => summary.debits += entry.amount.abs(),
            EntryKind::Hold => summary.holds += entry.amount.abs(),
            EntryKind::Release => summary.releases += entry.amount,
            EntryKind::Adjust => summary.adjustments += entry.amount,
        }
        summary.net += entry.amount;
        summary.entry_count += 1;
    }
    summary
}

/// Cached balance disagreeing with the chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceDrift {
    pub user_id: UserId,
    pub cached_balance: Decimal,
    pub chain_balance: Option<Decimal>,
    pub detail: String,
}

//! Wallet Ledger
//!
//! Append-only per-user chain of signed entries. `Actor.wallet_balance`
//! is a cache of the chain head and is only ever written together with a
//! new entry.

pub mod db;
pub mod service;
pub mod types;

pub use db::{LedgerStore, PgLedgerStore, append_entry_tx};
pub use service::LedgerService;
pub use types::{
    BalanceDrift, ChainBreak, ChainLink, EntryKind, LedgerDraft, LedgerEntry, LedgerSummary,
    next_link, summarize, verify_chain,
};

//! # ledger-core
//!
//! Append-only credit ledger with balance resolution, a check-and-debit
//! execution gate, and a pre-account trial guard.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         LedgerStore                          │
//! │   ledger_entries · accounts · webhook_events · trial_usage   │
//! └──────────────────────────────────────────────────────────────┘
//!        ▲                  ▲                   ▲
//!        │                  │                   │
//! ┌──────────────┐  ┌────────────────┐  ┌──────────────────┐
//! │   Balance    │  │ ExecutionGate  │  │   TrialGuard     │
//! │   Resolver   │  │ debit → action │  │ fingerprint gate │
//! │              │  │ → refund       │  │ (no ledger I/O)  │
//! └──────────────┘  └────────────────┘  └──────────────────┘
//! ```
//!
//! The ledger is the only source of truth for credits: a balance is the sum
//! of an account's entries. Entries are never updated or deleted; mistakes
//! are corrected with new compensating entries.

pub mod balance;
pub mod config;
pub mod error;
pub mod gate;
pub mod model;
pub mod store;
pub mod trial;

pub use balance::{BalanceCheck, BalanceResolver, LedgerPage, ReconciliationReport};
pub use config::{LedgerConfig, RetryConfig, TrialConfig};
pub use error::{ExecutionError, LedgerError, Result};
pub use gate::ExecutionGate;
pub use model::{
    Account, AccountId, EntryId, EntryKind, LedgerEntry, MAX_ENTRY_AMOUNT, NewEntry,
    TrialBlockReason, TrialUsageRecord, WebhookApplication, WebhookOutcome, WebhookRecord,
};
pub use store::{LedgerQuery, LedgerStore, MemoryLedgerStore, SqliteLedgerStore, TrialStore};
pub use trial::{ClientFingerprint, TrialDecision, TrialGuard};

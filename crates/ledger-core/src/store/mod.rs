//! Ledger Storage
//!
//! Append-only storage for ledger entries, webhook dedup records and trial
//! usage. Uniqueness of `external_reference` and `event_id` is enforced by
//! the store itself so that duplicate deliveries racing each other (possibly
//! from different processes) can never both be applied.

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Account, AccountId, LedgerEntry, NewEntry, TrialBlockReason, TrialUsageRecord,
    WebhookApplication, WebhookRecord,
};

/// Default and maximum page size for ledger listings
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

/// Filter for [`LedgerStore::list_by_account`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Only entries created at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Only entries with a sequence strictly greater than this cursor
    pub after_sequence: Option<i64>,

    /// Maximum number of entries; `None` returns everything
    pub limit: Option<usize>,
}

impl LedgerQuery {
    pub fn page(after_sequence: Option<i64>, limit: usize) -> Self {
        Self {
            since: None,
            after_sequence,
            limit: Some(limit.clamp(1, MAX_PAGE_SIZE)),
        }
    }

    pub(crate) fn matches(&self, entry: &LedgerEntry) -> bool {
        self.since.is_none_or(|since| entry.created_at >= since)
            && self.after_sequence.is_none_or(|after| entry.sequence > after)
    }
}

/// Ledger storage trait
///
/// Entries are never updated or deleted. Every successful write is durable
/// before the call returns, and the account's cached balance is updated in
/// the same transaction as the entry.
pub trait LedgerStore: Send + Sync {
    /// Create an account (returns the existing one if already registered)
    fn register_account(&self, account_id: &AccountId) -> Result<Account>;

    /// Get an account
    fn account(&self, account_id: &AccountId) -> Result<Option<Account>>;

    /// Deactivate an account; it keeps its ledger but can no longer be debited
    fn deactivate_account(&self, account_id: &AccountId) -> Result<Account>;

    /// All known account ids
    fn account_ids(&self) -> Result<Vec<AccountId>>;

    /// Append an entry, creating the account if needed.
    ///
    /// Fails with `ConstraintViolation` if the entry's external reference is
    /// already present.
    fn append(&self, entry: NewEntry) -> Result<LedgerEntry>;

    /// Append a usage debit only if the account can cover it.
    ///
    /// The balance check and the insert happen in one transaction, so two
    /// concurrent debits can never both spend the last credit.
    fn append_debit(&self, entry: NewEntry) -> Result<LedgerEntry>;

    /// Entries for an account in creation order
    fn list_by_account(
        &self,
        account_id: &AccountId,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>>;

    /// Materialized balance (0 for unknown accounts)
    fn cached_balance(&self, account_id: &AccountId) -> Result<i64>;

    /// Sum of entry amounts, optionally only those created at or before `as_of`
    fn computed_balance(&self, account_id: &AccountId, as_of: Option<DateTime<Utc>>) -> Result<i64>;

    /// Record a gateway event and its ledger entry in one transaction.
    ///
    /// Returns `Duplicate` without writing anything if either the event id or
    /// the entry's external reference already exists.
    fn apply_webhook(
        &self,
        record: WebhookRecord,
        entry: Option<NewEntry>,
    ) -> Result<WebhookApplication>;

    /// Look up a processed gateway event
    fn webhook_event(&self, event_id: &str) -> Result<Option<WebhookRecord>>;
}

/// Decision returned by [`TrialStore::consume`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrialConsumption {
    pub allowed: bool,
    pub remaining: u32,
    pub reason: Option<TrialBlockReason>,
}

/// Trial usage storage, independent of the ledger
pub trait TrialStore: Send + Sync {
    /// Atomically check and consume one free use.
    ///
    /// A blocked record never grants usage again.
    fn consume(
        &self,
        fingerprint: &str,
        resource_id: &str,
        limit: u32,
        window: chrono::TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<TrialConsumption>;

    /// Get the usage record for a (fingerprint, resource) pair
    fn trial_record(
        &self,
        fingerprint: &str,
        resource_id: &str,
    ) -> Result<Option<TrialUsageRecord>>;
}

/// Trial state transition shared by every [`TrialStore`]
pub(crate) fn advance_trial(
    record: &mut TrialUsageRecord,
    limit: u32,
    now: DateTime<Utc>,
) -> TrialConsumption {
    if !record.blocked {
        if now > record.window_expires_at {
            record.blocked = true;
            record.block_reason = Some(TrialBlockReason::Expired);
        } else if record.queries_used >= limit {
            record.blocked = true;
            record.block_reason = Some(TrialBlockReason::Exhausted);
        }
    }

    if record.blocked {
        return TrialConsumption {
            allowed: false,
            remaining: 0,
            reason: record.block_reason,
        };
    }

    record.queries_used += 1;
    if record.queries_used >= limit {
        record.blocked = true;
        record.block_reason = Some(TrialBlockReason::Exhausted);
    }

    TrialConsumption {
        allowed: true,
        remaining: limit.saturating_sub(record.queries_used),
        reason: None,
    }
}

/// A fresh trial record for the first use of a pair
pub(crate) fn fresh_trial(
    fingerprint: &str,
    resource_id: &str,
    window: chrono::TimeDelta,
    now: DateTime<Utc>,
) -> TrialUsageRecord {
    TrialUsageRecord {
        client_fingerprint: fingerprint.to_string(),
        resource_id: resource_id.to_string(),
        queries_used: 0,
        first_used_at: now,
        window_expires_at: now + window,
        blocked: false,
        block_reason: None,
    }
}

/// Balance after applying `entry`, or `InvalidAmount` if it would overflow
pub(crate) fn checked_balance(entry: &NewEntry, current: i64) -> Result<i64> {
    current.checked_add(entry.amount).ok_or_else(|| {
        crate::error::LedgerError::InvalidAmount(format!(
            "{} on {} would overflow the balance of {current}",
            entry.amount, entry.account_id
        ))
    })
}

/// Next creation timestamp: never earlier than, nor equal to, the previous one
pub(crate) fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
    match last {
        Some(last) if now <= last => last + chrono::TimeDelta::microseconds(1),
        _ => now,
    }
}

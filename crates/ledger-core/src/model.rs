//! Ledger Data Model
//!
//! Accounts, immutable ledger entries, webhook dedup records and trial usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Largest credit amount a single entry may carry, in either direction
pub const MAX_ENTRY_AMOUNT: i64 = 1_000_000_000_000;

/// Opaque account identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ledger entry identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An account that owns ledger entries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,

    /// Materialized running total; always re-derivable from the ledger
    pub balance_cache: i64,

    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(account_id: AccountId, created_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance_cache: 0,
            active: true,
            created_at,
            deactivated_at: None,
        }
    }
}

/// What caused a ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Purchase,
    SubscriptionGrant,
    UsageDebit,
    Refund,
    ManualAdjustment,
}

impl EntryKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::SubscriptionGrant => "subscription_grant",
            Self::UsageDebit => "usage_debit",
            Self::Refund => "refund",
            Self::ManualAdjustment => "manual_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(Self::Purchase),
            "subscription_grant" => Some(Self::SubscriptionGrant),
            "usage_debit" => Some(Self::UsageDebit),
            "refund" => Some(Self::Refund),
            "manual_adjustment" => Some(Self::ManualAdjustment),
            _ => None,
        }
    }

    /// Check that `amount` has the sign this kind requires and is in range
    pub fn validate_amount(self, amount: i64) -> Result<()> {
        if amount.unsigned_abs() > MAX_ENTRY_AMOUNT.unsigned_abs() {
            return Err(LedgerError::InvalidAmount(format!(
                "{amount} exceeds the per-entry limit of {MAX_ENTRY_AMOUNT}"
            )));
        }

        let ok = match self {
            Self::Purchase | Self::SubscriptionGrant | Self::Refund => amount > 0,
            Self::UsageDebit => amount < 0,
            Self::ManualAdjustment => amount != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(LedgerError::InvalidAmount(format!(
                "{amount} is not a valid {} amount",
                self.as_str()
            )))
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry that has not been written yet
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub amount: i64,
    pub kind: EntryKind,
    pub description: String,
    pub external_reference: Option<String>,
    pub related_entry: Option<EntryId>,
}

impl NewEntry {
    pub fn new(
        account_id: AccountId,
        amount: i64,
        kind: EntryKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            amount,
            kind,
            description: description.into(),
            external_reference: None,
            related_entry: None,
        }
    }

    /// Credit from a gateway payment, deduplicated by the gateway's event id
    pub fn purchase(
        account_id: AccountId,
        credits: i64,
        description: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self::new(account_id, credits, EntryKind::Purchase, description)
            .with_external_reference(event_id)
    }

    /// Recurring subscription credit, deduplicated by the gateway's event id
    pub fn subscription_grant(
        account_id: AccountId,
        credits: i64,
        description: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self::new(account_id, credits, EntryKind::SubscriptionGrant, description)
            .with_external_reference(event_id)
    }

    /// Debit for a paid action; `cost` is positive
    pub fn usage_debit(account_id: AccountId, cost: i64, description: impl Into<String>) -> Self {
        Self::new(account_id, -cost, EntryKind::UsageDebit, description)
    }

    /// Compensating credit for a failed action
    pub fn refund(debit: &LedgerEntry, description: impl Into<String>) -> Self {
        let mut entry = Self::new(
            debit.account_id.clone(),
            -debit.amount,
            EntryKind::Refund,
            description,
        );
        entry.related_entry = Some(debit.entry_id);
        entry
    }

    pub fn with_external_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference = Some(reference.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.kind.validate_amount(self.amount)
    }
}

/// An immutable, persisted ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,

    /// Store-assigned creation order
    pub sequence: i64,

    pub account_id: AccountId,
    pub amount: i64,
    pub kind: EntryKind,
    pub description: String,
    pub external_reference: Option<String>,
    pub related_entry: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn from_new(entry: NewEntry, sequence: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            entry_id: EntryId::new(),
            sequence,
            account_id: entry.account_id,
            amount: entry.amount,
            kind: entry.kind,
            description: entry.description,
            external_reference: entry.external_reference,
            related_entry: entry.related_entry,
            created_at,
        }
    }
}

/// How a gateway notification was handled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    IgnoredDuplicate,
    IgnoredUnhandledType,
}

impl WebhookOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::IgnoredDuplicate => "ignored_duplicate",
            Self::IgnoredUnhandledType => "ignored_unhandled_type",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "ignored_duplicate" => Some(Self::IgnoredDuplicate),
            "ignored_unhandled_type" => Some(Self::IgnoredUnhandledType),
            _ => None,
        }
    }
}

/// Dedup record for a processed gateway event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
    pub outcome: WebhookOutcome,

    /// Ledger entry produced by this event, if any
    pub entry_id: Option<EntryId>,
}

impl WebhookRecord {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        outcome: WebhookOutcome,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            processed_at: Utc::now(),
            outcome,
            entry_id: None,
        }
    }
}

/// Result of [`crate::store::LedgerStore::apply_webhook`]
#[derive(Clone, Debug)]
pub enum WebhookApplication {
    /// First delivery; the dedup row (and entry, if any) were written
    Recorded {
        record: WebhookRecord,
        entry: Option<LedgerEntry>,
    },

    /// The event id or its external reference was already present
    Duplicate,
}

/// Why a trial stopped granting free usage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialBlockReason {
    Exhausted,
    Expired,
}

impl TrialBlockReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exhausted" => Some(Self::Exhausted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrialBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free usage tracked per (fingerprint, resource) before an account exists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialUsageRecord {
    pub client_fingerprint: String,
    pub resource_id: String,
    pub queries_used: u32,
    pub first_used_at: DateTime<Utc>,
    pub window_expires_at: DateTime<Utc>,
    pub blocked: bool,
    pub block_reason: Option<TrialBlockReason>,
}

//! In-memory ledger store (for development and tests)
//!
//! Mirrors the uniqueness constraints of the SQLite schema: one account row
//! per id, unique external references, unique webhook event ids.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};

use super::{
    LedgerQuery, LedgerStore, TrialConsumption, TrialStore, advance_trial, checked_balance,
    fresh_trial, next_timestamp,
};
use crate::error::{LedgerError, Result};
use crate::model::{
    Account, AccountId, EntryKind, LedgerEntry, NewEntry, TrialUsageRecord, WebhookApplication,
    WebhookRecord,
};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    entries: Vec<LedgerEntry>,
    external_references: HashSet<String>,
    webhooks: HashMap<String, WebhookRecord>,
    last_created_at: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn insert(&mut self, entry: NewEntry) -> Result<LedgerEntry> {
        entry.validate()?;

        if let Some(reference) = &entry.external_reference {
            if self.external_references.contains(reference) {
                return Err(LedgerError::ConstraintViolation(format!(
                    "external reference {reference} already recorded"
                )));
            }
        }

        let current = self.accounts.get(&entry.account_id).map_or(0, |a| a.balance_cache);
        let balance = checked_balance(&entry, current)?;

        let created_at = next_timestamp(self.last_created_at);
        let sequence = i64::try_from(self.entries.len()).unwrap_or(i64::MAX) + 1;
        let account = self
            .accounts
            .entry(entry.account_id.clone())
            .or_insert_with(|| Account::new(entry.account_id.clone(), created_at));
        account.balance_cache = balance;

        if let Some(reference) = &entry.external_reference {
            self.external_references.insert(reference.clone());
        }

        let entry = LedgerEntry::from_new(entry, sequence, created_at);
        self.last_created_at = Some(created_at);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn entries_for<'a>(
        &'a self,
        account_id: &'a AccountId,
    ) -> impl Iterator<Item = &'a LedgerEntry> {
        self.entries.iter().filter(move |e| &e.account_id == account_id)
    }
}

/// In-memory ledger and trial store
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<LedgerState>,
    trials: Mutex<HashMap<(String, String), TrialUsageRecord>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.ledger
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".into()))
    }

    fn trials(&self) -> Result<MutexGuard<'_, HashMap<(String, String), TrialUsageRecord>>> {
        self.trials
            .lock()
            .map_err(|_| LedgerError::Storage("trial lock poisoned".into()))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn register_account(&self, account_id: &AccountId) -> Result<Account> {
        let mut state = self.ledger()?;
        let account = state
            .accounts
            .entry(account_id.clone())
            .or_insert_with(|| Account::new(account_id.clone(), Utc::now()));
        Ok(account.clone())
    }

    fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        Ok(self.ledger()?.accounts.get(account_id).cloned())
    }

    fn deactivate_account(&self, account_id: &AccountId) -> Result<Account> {
        let mut state = self.ledger()?;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;
        if account.active {
            account.active = false;
            account.deactivated_at = Some(Utc::now());
        }
        Ok(account.clone())
    }

    fn account_ids(&self) -> Result<Vec<AccountId>> {
        let mut ids: Vec<_> = self.ledger()?.accounts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn append(&self, entry: NewEntry) -> Result<LedgerEntry> {
        self.ledger()?.insert(entry)
    }

    fn append_debit(&self, entry: NewEntry) -> Result<LedgerEntry> {
        if entry.kind != EntryKind::UsageDebit {
            return Err(LedgerError::InvalidAmount(format!(
                "{} entries cannot be appended as debits",
                entry.kind
            )));
        }
        entry.validate()?;

        let mut state = self.ledger()?;
        let (balance, active) = state
            .accounts
            .get(&entry.account_id)
            .map_or((0, true), |a| (a.balance_cache, a.active));

        if !active {
            return Err(LedgerError::AccountInactive(entry.account_id));
        }
        if balance < -entry.amount {
            return Err(LedgerError::InsufficientCredits {
                account: entry.account_id,
                balance,
                required: -entry.amount,
            });
        }

        state.insert(entry)
    }

    fn list_by_account(
        &self,
        account_id: &AccountId,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.ledger()?;
        let matching = state.entries_for(account_id).filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn cached_balance(&self, account_id: &AccountId) -> Result<i64> {
        Ok(self
            .ledger()?
            .accounts
            .get(account_id)
            .map_or(0, |a| a.balance_cache))
    }

    fn computed_balance(
        &self,
        account_id: &AccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let state = self.ledger()?;
        Ok(state
            .entries_for(account_id)
            .filter(|e| as_of.is_none_or(|t| e.created_at <= t))
            .map(|e| e.amount)
            .sum())
    }

    fn apply_webhook(
        &self,
        mut record: WebhookRecord,
        entry: Option<NewEntry>,
    ) -> Result<WebhookApplication> {
        let mut state = self.ledger()?;

        if state.webhooks.contains_key(&record.event_id) {
            return Ok(WebhookApplication::Duplicate);
        }

        let entry = match entry {
            Some(entry) => match state.insert(entry) {
                Ok(entry) => Some(entry),
                Err(LedgerError::ConstraintViolation(_)) => {
                    return Ok(WebhookApplication::Duplicate);
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        record.entry_id = entry.as_ref().map(|e| e.entry_id);
        state.webhooks.insert(record.event_id.clone(), record.clone());
        Ok(WebhookApplication::Recorded { record, entry })
    }

    fn webhook_event(&self, event_id: &str) -> Result<Option<WebhookRecord>> {
        Ok(self.ledger()?.webhooks.get(event_id).cloned())
    }
}

impl TrialStore for MemoryLedgerStore {
    fn consume(
        &self,
        fingerprint: &str,
        resource_id: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<TrialConsumption> {
        let mut trials = self.trials()?;
        let record = trials
            .entry((fingerprint.to_string(), resource_id.to_string()))
            .or_insert_with(|| fresh_trial(fingerprint, resource_id, window, now));
        Ok(advance_trial(record, limit, now))
    }

    fn trial_record(
        &self,
        fingerprint: &str,
        resource_id: &str,
    ) -> Result<Option<TrialUsageRecord>> {
        Ok(self
            .trials()?
            .get(&(fingerprint.to_string(), resource_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct() -> AccountId {
        AccountId::from_string("acct_mem")
    }

    #[test]
    fn test_append_updates_cache() {
        let store = MemoryLedgerStore::new();
        store
            .append(NewEntry::purchase(acct(), 500, "starter pack", "evt_1"))
            .unwrap();
        store.append_debit(NewEntry::usage_debit(acct(), 20, "run")).unwrap();

        assert_eq!(store.cached_balance(&acct()).unwrap(), 480);
        assert_eq!(store.computed_balance(&acct(), None).unwrap(), 480);
    }

    #[test]
    fn test_duplicate_external_reference_rejected() {
        let store = MemoryLedgerStore::new();
        store.append(NewEntry::purchase(acct(), 500, "pack", "evt_1")).unwrap();
        let err = store
            .append(NewEntry::purchase(acct(), 500, "pack", "evt_1"))
            .unwrap_err();

        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
        assert_eq!(store.cached_balance(&acct()).unwrap(), 500);
    }

    #[test]
    fn test_debit_refused_when_short() {
        let store = MemoryLedgerStore::new();
        store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "seed"))
            .unwrap();
        let err = store.append_debit(NewEntry::usage_debit(acct(), 15, "run")).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientCredits { balance: 10, required: 15, .. }
        ));
        assert_eq!(store.list_by_account(&acct(), &LedgerQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_balance_overflow_is_rejected() {
        let store = MemoryLedgerStore::new();
        store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "seed"))
            .unwrap();
        if let Some(account) = store.ledger().unwrap().accounts.get_mut(&acct()) {
            account.balance_cache = i64::MAX - 5;
        }

        let err = store
            .append(NewEntry::purchase(acct(), 10, "pack", "evt_big"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(store.cached_balance(&acct()).unwrap(), i64::MAX - 5);
        assert_eq!(store.list_by_account(&acct(), &LedgerQuery::default()).unwrap().len(), 1);

        // The rejected reference was not consumed
        assert!(store.ledger().unwrap().external_references.is_empty());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let store = MemoryLedgerStore::new();
        for i in 0..20 {
            store
                .append(NewEntry::new(acct(), 1 + i, EntryKind::ManualAdjustment, "tick"))
                .unwrap();
        }
        let entries = store.list_by_account(&acct(), &LedgerQuery::default()).unwrap();
        assert!(entries.windows(2).all(|w| w[0].created_at < w[1].created_at));
        assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}

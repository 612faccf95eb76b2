//! Balance Resolution
//!
//! Reads balances from the ledger, checks the materialized cache against a
//! full fold over entries, and records manual adjustments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::model::{AccountId, EntryKind, LedgerEntry, NewEntry};
use crate::store::{LedgerQuery, LedgerStore};

/// Cached vs recomputed balance for one account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub account_id: AccountId,
    pub cached: i64,
    pub computed: i64,
}

impl BalanceCheck {
    pub const fn is_consistent(&self) -> bool {
        self.cached == self.computed
    }
}

/// Result of a full reconciliation pass
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub accounts_checked: usize,
    pub mismatches: Vec<BalanceCheck>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// One page of ledger history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,

    /// Pass as `after_sequence` to fetch the next page; `None` on the last page
    pub next_cursor: Option<i64>,
}

/// Computes balances over a [`LedgerStore`]
pub struct BalanceResolver<S: LedgerStore + ?Sized> {
    store: Arc<S>,
}

impl<S: LedgerStore + ?Sized> Clone for BalanceResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LedgerStore + ?Sized> BalanceResolver<S> {
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Current balance.
    ///
    /// Served from the cache, which is written in the same transaction as
    /// every entry, so a caller always sees its own prior writes.
    pub fn get_balance(&self, account_id: &AccountId) -> Result<i64> {
        self.store.cached_balance(account_id)
    }

    /// Balance counting only entries created at or before `at`
    pub fn get_balance_as_of(&self, account_id: &AccountId, at: DateTime<Utc>) -> Result<i64> {
        self.store.computed_balance(account_id, Some(at))
    }

    /// Compare the cached balance with a fold over the ledger
    pub fn verify(&self, account_id: &AccountId) -> Result<BalanceCheck> {
        Ok(BalanceCheck {
            account_id: account_id.clone(),
            cached: self.store.cached_balance(account_id)?,
            computed: self.store.computed_balance(account_id, None)?,
        })
    }

    /// Recompute every account from scratch and report drift
    pub fn reconcile_all(&self) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        for account_id in self.store.account_ids()? {
            let check = self.verify(&account_id)?;
            report.accounts_checked += 1;

            if !check.is_consistent() {
                tracing::error!(
                    target: "audit",
                    account_id = %check.account_id,
                    cached = check.cached,
                    computed = check.computed,
                    "Balance cache disagrees with ledger"
                );
                report.mismatches.push(check);
            }
        }

        tracing::info!(
            accounts = report.accounts_checked,
            mismatches = report.mismatches.len(),
            "Balance reconciliation finished"
        );
        Ok(report)
    }

    /// One page of an account's ledger, oldest first
    pub fn list_ledger(&self, account_id: &AccountId, query: &LedgerQuery) -> Result<LedgerPage> {
        let entries = self.store.list_by_account(account_id, query)?;
        let full_page = query.limit.is_some_and(|limit| entries.len() >= limit);
        let next_cursor = if full_page {
            entries.last().map(|e| e.sequence)
        } else {
            None
        };
        Ok(LedgerPage {
            entries,
            next_cursor,
        })
    }

    /// Record an administrative correction
    pub fn adjust(
        &self,
        account_id: &AccountId,
        amount: i64,
        description: &str,
    ) -> Result<LedgerEntry> {
        if description.trim().is_empty() {
            return Err(LedgerError::InvalidAmount(
                "adjustments require a description".into(),
            ));
        }

        let entry = self.store.append(NewEntry::new(
            account_id.clone(),
            amount,
            EntryKind::ManualAdjustment,
            description,
        ))?;

        tracing::info!(
            target: "audit",
            account_id = %account_id,
            amount,
            entry_id = %entry.entry_id,
            "Manual adjustment recorded"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, SqliteLedgerStore};

    fn acct() -> AccountId {
        AccountId::from_string("acct_bal")
    }

    fn seeded<S: LedgerStore>(store: S) -> BalanceResolver<S> {
        let resolver = BalanceResolver::new(Arc::new(store));
        resolver.adjust(&acct(), 100, "opening balance").unwrap();
        resolver
    }

    #[test]
    fn test_sum_law_holds() {
        let resolver = seeded(SqliteLedgerStore::in_memory().unwrap());
        resolver.store.append_debit(NewEntry::usage_debit(acct(), 30, "run")).unwrap();
        resolver.adjust(&acct(), -5, "goodwill reversal").unwrap();

        let sum: i64 = resolver
            .store
            .list_by_account(&acct(), &LedgerQuery::default())
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(resolver.get_balance(&acct()).unwrap(), sum);
        assert_eq!(sum, 65);
        assert!(resolver.verify(&acct()).unwrap().is_consistent());
    }

    #[test]
    fn test_balance_as_of() {
        let resolver = seeded(MemoryLedgerStore::new());
        let checkpoint = resolver
            .store
            .list_by_account(&acct(), &LedgerQuery::default())
            .unwrap()[0]
            .created_at;
        resolver.adjust(&acct(), 50, "bonus").unwrap();

        assert_eq!(resolver.get_balance_as_of(&acct(), checkpoint).unwrap(), 100);
        assert_eq!(resolver.get_balance(&acct()).unwrap(), 150);
    }

    #[test]
    fn test_reconcile_detects_drift() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let resolver = seeded(store);
        assert!(resolver.reconcile_all().unwrap().is_clean());

        // Corrupt the cache behind the store's back.
        resolver
            .store
            .conn()
            .unwrap()
            .execute("UPDATE accounts SET balance_cache = 7", [])
            .unwrap();

        let report = resolver.reconcile_all().unwrap();
        assert_eq!(report.accounts_checked, 1);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].cached, 7);
        assert_eq!(report.mismatches[0].computed, 100);
    }

    #[test]
    fn test_list_ledger_pages() {
        let resolver = seeded(MemoryLedgerStore::new());
        resolver.adjust(&acct(), 1, "a").unwrap();
        resolver.adjust(&acct(), 2, "b").unwrap();

        let page = resolver.list_ledger(&acct(), &LedgerQuery::page(None, 2)).unwrap();
        assert_eq!(page.entries.len(), 2);
        let next = resolver
            .list_ledger(&acct(), &LedgerQuery::page(page.next_cursor, 2))
            .unwrap();
        assert_eq!(next.entries.len(), 1);
        assert_eq!(next.next_cursor, None);
    }

    #[test]
    fn test_oversized_adjustments_keep_balance_readable() {
        let resolver = seeded(SqliteLedgerStore::in_memory().unwrap());
        assert!(matches!(
            resolver.adjust(&acct(), i64::MAX, "typo"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            resolver.adjust(&acct(), i64::MAX, "typo again"),
            Err(LedgerError::InvalidAmount(_))
        ));

        assert_eq!(resolver.get_balance(&acct()).unwrap(), 100);
        assert!(resolver.verify(&acct()).unwrap().is_consistent());
    }

    #[test]
    fn test_adjust_requires_description() {
        let resolver = BalanceResolver::new(Arc::new(MemoryLedgerStore::new()));
        assert!(resolver.adjust(&acct(), 10, "  ").is_err());
    }
}

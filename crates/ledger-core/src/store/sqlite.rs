//! SQLite ledger store
//!
//! Every write runs in an `IMMEDIATE` transaction, which takes SQLite's
//! write lock up front. That makes the debit balance check and the dedup
//! inserts serializable across connections and processes sharing the file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use super::{
    LedgerQuery, LedgerStore, TrialConsumption, TrialStore, advance_trial, checked_balance,
    fresh_trial, migrations, next_timestamp,
};
use crate::error::{LedgerError, Result};
use crate::model::{
    Account, AccountId, EntryId, EntryKind, LedgerEntry, NewEntry, TrialBlockReason,
    TrialUsageRecord, WebhookApplication, WebhookOutcome, WebhookRecord,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTRY_COLUMNS: &str = "sequence, entry_id, account_id, amount, kind, description, \
                             external_reference, related_entry, created_at";

pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("connection lock poisoned".into()))
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(idx: usize, value: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| invalid_column(idx, &value.to_string()))
}

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {value}").into(),
    )
}

fn parse_entry_id(idx: usize, value: &str) -> rusqlite::Result<EntryId> {
    Uuid::parse_str(value)
        .map(EntryId::from_uuid)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = row.get(4)?;
    let related: Option<String> = row.get(7)?;
    Ok(LedgerEntry {
        sequence: row.get(0)?,
        entry_id: parse_entry_id(1, &row.get::<_, String>(1)?)?,
        account_id: AccountId::from_string(row.get::<_, String>(2)?),
        amount: row.get(3)?,
        kind: EntryKind::parse(&kind).ok_or_else(|| invalid_column(4, &kind))?,
        description: row.get(5)?,
        external_reference: row.get(6)?,
        related_entry: related.as_deref().map(|r| parse_entry_id(7, r)).transpose()?,
        created_at: from_micros(8, row.get(8)?)?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let deactivated_at: Option<i64> = row.get(4)?;
    Ok(Account {
        account_id: AccountId::from_string(row.get::<_, String>(0)?),
        balance_cache: row.get(1)?,
        active: row.get(2)?,
        created_at: from_micros(3, row.get(3)?)?,
        deactivated_at: deactivated_at.map(|v| from_micros(4, v)).transpose()?,
    })
}

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookRecord> {
    let outcome: String = row.get(3)?;
    let entry_id: Option<String> = row.get(4)?;
    Ok(WebhookRecord {
        event_id: row.get(0)?,
        event_type: row.get(1)?,
        processed_at: from_micros(2, row.get(2)?)?,
        outcome: WebhookOutcome::parse(&outcome).ok_or_else(|| invalid_column(3, &outcome))?,
        entry_id: entry_id.as_deref().map(|e| parse_entry_id(4, e)).transpose()?,
    })
}

fn trial_from_row(row: &Row<'_>) -> rusqlite::Result<TrialUsageRecord> {
    let reason: Option<String> = row.get(6)?;
    Ok(TrialUsageRecord {
        client_fingerprint: row.get(0)?,
        resource_id: row.get(1)?,
        queries_used: row.get(2)?,
        first_used_at: from_micros(3, row.get(3)?)?,
        window_expires_at: from_micros(4, row.get(4)?)?,
        blocked: row.get(5)?,
        block_reason: reason
            .as_deref()
            .map(|r| TrialBlockReason::parse(r).ok_or_else(|| invalid_column(6, r)))
            .transpose()?,
    })
}

fn select_account(conn: &Connection, account_id: &AccountId) -> Result<Option<Account>> {
    Ok(conn
        .query_row(
            "SELECT account_id, balance_cache, active, created_at, deactivated_at
             FROM accounts WHERE account_id = ?1",
            [account_id.as_str()],
            account_from_row,
        )
        .optional()?)
}

fn insert_entry(tx: &Transaction<'_>, entry: NewEntry) -> Result<LedgerEntry> {
    entry.validate()?;

    let last: Option<i64> =
        tx.query_row("SELECT MAX(created_at) FROM ledger_entries", [], |row| row.get(0))?;
    let last = last.and_then(DateTime::from_timestamp_micros);
    let created_at = next_timestamp(last);

    tx.execute(
        "INSERT OR IGNORE INTO accounts (account_id, created_at) VALUES (?1, ?2)",
        params![entry.account_id.as_str(), micros(created_at)],
    )?;

    let current: i64 = tx.query_row(
        "SELECT balance_cache FROM accounts WHERE account_id = ?1",
        [entry.account_id.as_str()],
        |row| row.get(0),
    )?;
    let balance = checked_balance(&entry, current)?;

    let mut entry = LedgerEntry::from_new(entry, 0, created_at);
    tx.execute(
        "INSERT INTO ledger_entries
            (entry_id, account_id, amount, kind, description,
             external_reference, related_entry, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.entry_id.to_string(),
            entry.account_id.as_str(),
            entry.amount,
            entry.kind.as_str(),
            entry.description,
            entry.external_reference,
            entry.related_entry.map(|id| id.to_string()),
            micros(entry.created_at),
        ],
    )?;
    entry.sequence = tx.last_insert_rowid();

    tx.execute(
        "UPDATE accounts SET balance_cache = ?1 WHERE account_id = ?2",
        params![balance, entry.account_id.as_str()],
    )?;

    Ok(entry)
}

impl LedgerStore for SqliteLedgerStore {
    fn register_account(&self, account_id: &AccountId) -> Result<Account> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO accounts (account_id, created_at) VALUES (?1, ?2)",
            params![account_id.as_str(), micros(Utc::now())],
        )?;
        let account = select_account(&tx, account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;
        tx.commit()?;
        Ok(account)
    }

    fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let conn = self.conn()?;
        select_account(&conn, account_id)
    }

    fn deactivate_account(&self, account_id: &AccountId) -> Result<Account> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE accounts SET active = 0, deactivated_at = ?1
             WHERE account_id = ?2 AND active = 1",
            params![micros(Utc::now()), account_id.as_str()],
        )?;
        let account = select_account(&tx, account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;
        tx.commit()?;
        Ok(account)
    }

    fn account_ids(&self) -> Result<Vec<AccountId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT account_id FROM accounts ORDER BY account_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0).map(AccountId::from_string))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn append(&self, entry: NewEntry) -> Result<LedgerEntry> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = insert_entry(&tx, entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn append_debit(&self, entry: NewEntry) -> Result<LedgerEntry> {
        if entry.kind != EntryKind::UsageDebit {
            return Err(LedgerError::InvalidAmount(format!(
                "{} entries cannot be appended as debits",
                entry.kind
            )));
        }
        entry.validate()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (balance, active) = select_account(&tx, &entry.account_id)?
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

        let entry = insert_entry(&tx, entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn list_by_account(
        &self,
        account_id: &AccountId,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let limit = query
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries
             WHERE account_id = ?1
               AND (?2 IS NULL OR created_at >= ?2)
               AND (?3 IS NULL OR sequence > ?3)
             ORDER BY sequence
             LIMIT ?4"
        ))?;
        let entries = stmt
            .query_map(
                params![
                    account_id.as_str(),
                    query.since.map(micros),
                    query.after_sequence,
                    limit
                ],
                entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn cached_balance(&self, account_id: &AccountId) -> Result<i64> {
        let conn = self.conn()?;
        Ok(select_account(&conn, account_id)?.map_or(0, |a| a.balance_cache))
    }

    fn computed_balance(
        &self,
        account_id: &AccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries
             WHERE account_id = ?1 AND (?2 IS NULL OR created_at <= ?2)",
            params![account_id.as_str(), as_of.map(micros)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn apply_webhook(
        &self,
        mut record: WebhookRecord,
        entry: Option<NewEntry>,
    ) -> Result<WebhookApplication> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Dropping `tx` on an early return rolls everything back.
        let entry = match entry.map(|e| insert_entry(&tx, e)).transpose() {
            Ok(entry) => entry,
            Err(LedgerError::ConstraintViolation(_)) => return Ok(WebhookApplication::Duplicate),
            Err(e) => return Err(e),
        };
        record.entry_id = entry.as_ref().map(|e| e.entry_id);

        let inserted = tx.execute(
            "INSERT INTO webhook_events (event_id, event_type, processed_at, outcome, entry_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.event_id,
                record.event_type,
                micros(record.processed_at),
                record.outcome.as_str(),
                record.entry_id.map(|id| id.to_string()),
            ],
        );
        match inserted.map_err(LedgerError::from) {
            Ok(_) => {}
            Err(LedgerError::ConstraintViolation(_)) => return Ok(WebhookApplication::Duplicate),
            Err(e) => return Err(e),
        }

        tx.commit()?;
        Ok(WebhookApplication::Recorded { record, entry })
    }

    fn webhook_event(&self, event_id: &str) -> Result<Option<WebhookRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT event_id, event_type, processed_at, outcome, entry_id
                 FROM webhook_events WHERE event_id = ?1",
                [event_id],
                webhook_from_row,
            )
            .optional()?)
    }
}

impl TrialStore for SqliteLedgerStore {
    fn consume(
        &self,
        fingerprint: &str,
        resource_id: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<TrialConsumption> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = tx
            .query_row(
                "SELECT client_fingerprint, resource_id, queries_used, first_used_at,
                        window_expires_at, blocked, block_reason
                 FROM trial_usage WHERE client_fingerprint = ?1 AND resource_id = ?2",
                [fingerprint, resource_id],
                trial_from_row,
            )
            .optional()?
            .unwrap_or_else(|| fresh_trial(fingerprint, resource_id, window, now));

        let decision = advance_trial(&mut record, limit, now);

        tx.execute(
            "INSERT INTO trial_usage
                (client_fingerprint, resource_id, queries_used, first_used_at,
                 window_expires_at, blocked, block_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (client_fingerprint, resource_id) DO UPDATE SET
                queries_used = excluded.queries_used,
                blocked = excluded.blocked,
                block_reason = excluded.block_reason",
            params![
                record.client_fingerprint,
                record.resource_id,
                record.queries_used,
                micros(record.first_used_at),
                micros(record.window_expires_at),
                record.blocked,
                record.block_reason.map(|r| r.as_str()),
            ],
        )?;
        tx.commit()?;

        Ok(decision)
    }

    fn trial_record(
        &self,
        fingerprint: &str,
        resource_id: &str,
    ) -> Result<Option<TrialUsageRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT client_fingerprint, resource_id, queries_used, first_used_at,
                        window_expires_at, blocked, block_reason
                 FROM trial_usage WHERE client_fingerprint = ?1 AND resource_id = ?2",
                [fingerprint, resource_id],
                trial_from_row,
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct() -> AccountId {
        AccountId::from_string("acct_sql")
    }

    #[test]
    fn test_unique_external_reference() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.append(NewEntry::purchase(acct(), 500, "pack", "evt_9")).unwrap();
        let err = store
            .append(NewEntry::purchase(acct(), 500, "pack", "evt_9"))
            .unwrap_err();

        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
        assert_eq!(store.cached_balance(&acct()).unwrap(), 500);
        assert_eq!(store.computed_balance(&acct(), None).unwrap(), 500);
    }

    #[test]
    fn test_balance_overflow_is_rejected() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "seed"))
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE accounts SET balance_cache = ?1", [i64::MAX - 5])
            .unwrap();

        let err = store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "too much"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let err = store
            .append(NewEntry::new(acct(), i64::MAX, EntryKind::ManualAdjustment, "way too much"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        // Nothing was written and the balance is still an integer
        assert_eq!(store.cached_balance(&acct()).unwrap(), i64::MAX - 5);
        assert_eq!(store.list_by_account(&acct(), &LedgerQuery::default()).unwrap().len(), 1);
        assert_eq!(store.computed_balance(&acct(), None).unwrap(), 10);
    }

    #[test]
    fn test_null_references_do_not_collide() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "seed"))
            .unwrap();
        store.append_debit(NewEntry::usage_debit(acct(), 3, "a")).unwrap();
        store.append_debit(NewEntry::usage_debit(acct(), 3, "b")).unwrap();

        assert_eq!(store.cached_balance(&acct()).unwrap(), 4);
    }

    #[test]
    fn test_webhook_dedup_rolls_back_entry() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let first = store
            .apply_webhook(
                WebhookRecord::new("evt_1", "checkout.session.completed", WebhookOutcome::Applied),
                Some(NewEntry::purchase(acct(), 500, "pack", "evt_1")),
            )
            .unwrap();
        assert!(matches!(first, WebhookApplication::Recorded { entry: Some(_), .. }));

        let second = store
            .apply_webhook(
                WebhookRecord::new("evt_1", "checkout.session.completed", WebhookOutcome::Applied),
                Some(NewEntry::purchase(acct(), 500, "pack", "evt_1")),
            )
            .unwrap();
        assert!(matches!(second, WebhookApplication::Duplicate));

        let entries = store.list_by_account(&acct(), &LedgerQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        let record = store.webhook_event("evt_1").unwrap().unwrap();
        assert_eq!(record.entry_id, Some(entries[0].entry_id));
    }

    #[test]
    fn test_webhook_without_entry_dedups_on_event_id() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let record =
            WebhookRecord::new("evt_x", "customer.created", WebhookOutcome::IgnoredUnhandledType);
        assert!(matches!(
            store.apply_webhook(record.clone(), None).unwrap(),
            WebhookApplication::Recorded { entry: None, .. }
        ));
        assert!(matches!(
            store.apply_webhook(record, None).unwrap(),
            WebhookApplication::Duplicate
        ));
    }

    #[test]
    fn test_entries_cannot_be_deleted() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .append(NewEntry::new(acct(), 10, EntryKind::ManualAdjustment, "seed"))
            .unwrap();
        let conn = store.conn().unwrap();
        assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
        assert!(conn.execute("UPDATE ledger_entries SET amount = 99", []).is_err());
    }

    #[test]
    fn test_pagination_cursor() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        for i in 1..=5 {
            store
                .append(NewEntry::new(acct(), i, EntryKind::ManualAdjustment, "tick"))
                .unwrap();
        }
        let first = store.list_by_account(&acct(), &LedgerQuery::page(None, 2)).unwrap();
        assert_eq!(first.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![1, 2]);

        let cursor = first.last().map(|e| e.sequence);
        let second = store.list_by_account(&acct(), &LedgerQuery::page(cursor, 10)).unwrap();
        assert_eq!(second.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_deactivate_unknown_account() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        assert!(matches!(
            store.deactivate_account(&acct()),
            Err(LedgerError::AccountNotFound(_))
        ));

        store.register_account(&acct()).unwrap();
        let account = store.deactivate_account(&acct()).unwrap();
        assert!(!account.active);
        assert!(account.deactivated_at.is_some());
    }
}

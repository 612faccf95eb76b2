//! Execution Gate
//!
//! Guards a paid action with an atomic check-and-debit. There is no held
//! state: the debit is written before the action runs and a refund entry
//! referencing it is written if the action fails.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::RetryConfig;
use crate::error::{ExecutionError, LedgerError, Result};
use crate::model::{AccountId, LedgerEntry, NewEntry};
use crate::store::LedgerStore;

/// Denials within this window count towards an audit escalation
const DENIAL_WINDOW_SECS: i64 = 600;
const DENIAL_ESCALATION_THRESHOLD: u32 = 5;

#[derive(Clone, Copy)]
enum WriteKind {
    Debit,
    Append,
}

/// Tracks repeated insufficient-credit denials per account
#[derive(Default)]
struct DenialTracker {
    windows: Mutex<HashMap<AccountId, (u32, DateTime<Utc>)>>,
}

impl DenialTracker {
    /// Record a denial and return how many fell in the current window
    fn record(&self, account_id: &AccountId, now: DateTime<Utc>) -> u32 {
        let Ok(mut windows) = self.windows.lock() else {
            return 1;
        };
        let slot = windows.entry(account_id.clone()).or_insert((0, now));
        if now - slot.1 > TimeDelta::seconds(DENIAL_WINDOW_SECS) {
            *slot = (0, now);
        }
        slot.0 += 1;
        slot.0
    }

    fn clear(&self, account_id: &AccountId) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(account_id);
        }
    }
}

/// Debits an account before running a paid action and refunds on failure
pub struct ExecutionGate<S: LedgerStore + ?Sized + 'static> {
    inner: Arc<GateInner<S>>,
}

struct GateInner<S: LedgerStore + ?Sized + 'static> {
    store: Arc<S>,
    retry: RetryConfig,
    denials: DenialTracker,
}

impl<S: LedgerStore + ?Sized + 'static> ExecutionGate<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                store,
                retry,
                denials: DenialTracker::default(),
            }),
        }
    }

    /// Charge `cost` credits and run `action`.
    ///
    /// If the balance cannot cover `cost` nothing is written and the action
    /// does not run. If the action fails, a refund for the same amount is
    /// appended before the action's error is returned, so the net balance
    /// change is zero.
    ///
    /// The debit, the action and any refund run on their own task: dropping
    /// the returned future does not stop them.
    pub async fn reserve_and_execute<T, F, Fut>(
        &self,
        account_id: &AccountId,
        cost: i64,
        label: &str,
        action: F,
    ) -> std::result::Result<T, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if cost <= 0 {
            let err = LedgerError::InvalidAmount(format!("cost must be positive, got {cost}"));
            return Err(err.into());
        }

        let inner = self.inner.clone();
        let account_id = account_id.clone();
        let label = label.to_string();
        let task = tokio::spawn(async move {
            inner.charge_and_run(&account_id, cost, &label, action).await
        });

        match task.await {
            Ok(result) => result,
            Err(join) => {
                Err(LedgerError::Storage(format!("execution task failed: {join}")).into())
            }
        }
    }
}

impl<S: LedgerStore + ?Sized + 'static> GateInner<S> {
    async fn charge_and_run<T, F, Fut>(
        &self,
        account_id: &AccountId,
        cost: i64,
        label: &str,
        action: F,
    ) -> std::result::Result<T, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let debit = NewEntry::usage_debit(account_id.clone(), cost, format!("usage: {label}"));
        let debit = match self.write(debit, WriteKind::Debit).await {
            Ok(debit) => debit,
            Err(err @ LedgerError::InsufficientCredits { .. }) => {
                self.note_denial(account_id, cost, &err);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        self.denials.clear(account_id);

        tracing::info!(
            account_id = %account_id,
            cost,
            label,
            debit_id = %debit.entry_id,
            "Credits debited for action"
        );

        // A panicking action is a failed action
        let outcome = match tokio::spawn(action()).await {
            Ok(outcome) => outcome,
            Err(join) => Err(anyhow::anyhow!("action task failed: {join}")),
        };

        match outcome {
            Ok(output) => Ok(output),
            Err(cause) => Err(self.compensate(&debit, label, cause).await),
        }
    }

    async fn compensate(
        &self,
        debit: &LedgerEntry,
        label: &str,
        cause: anyhow::Error,
    ) -> ExecutionError {
        let refund = NewEntry::refund(debit, format!("refund: {label} failed"));

        match self.write(refund, WriteKind::Append).await {
            Ok(refund) => {
                tracing::warn!(
                    account_id = %debit.account_id,
                    debit_id = %debit.entry_id,
                    refund_id = %refund.entry_id,
                    error = %cause,
                    "Action failed, debit refunded"
                );
                ExecutionError::ActionFailed {
                    debit_id: debit.entry_id,
                    refund_id: refund.entry_id,
                    cause,
                }
            }
            Err(refund_error) => {
                tracing::error!(
                    target: "audit",
                    account_id = %debit.account_id,
                    debit_id = %debit.entry_id,
                    amount = -debit.amount,
                    error = %refund_error,
                    "Refund could not be recorded after failed action"
                );
                ExecutionError::RefundFailed {
                    debit_id: debit.entry_id,
                    cause,
                    refund_error,
                }
            }
        }
    }

    fn note_denial(&self, account_id: &AccountId, cost: i64, err: &LedgerError) {
        let count = self.denials.record(account_id, Utc::now());
        if count >= DENIAL_ESCALATION_THRESHOLD {
            tracing::warn!(
                target: "audit",
                account_id = %account_id,
                cost,
                denials = count,
                "Repeated insufficient-credit denials"
            );
        } else {
            tracing::info!(target: "audit", account_id = %account_id, cost, "{err}");
        }
    }

    /// Run a ledger write on the blocking pool, retrying transient failures
    async fn write(&self, entry: NewEntry, kind: WriteKind) -> Result<LedgerEntry> {
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let pending = entry.clone();
            let result = tokio::task::spawn_blocking(move || match kind {
                WriteKind::Debit => store.append_debit(pending),
                WriteKind::Append => store.append(pending),
            })
            .await
            .map_err(|e| LedgerError::Storage(format!("ledger task failed: {e}")))
            .and_then(|r| r);

            match result {
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "Retrying ledger write");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

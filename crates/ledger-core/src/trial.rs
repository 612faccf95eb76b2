//! Trial Guard
//!
//! Grants a few free uses per client fingerprint before an account exists.
//! Never writes ledger entries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::TrialConfig;
use crate::error::Result;
use crate::model::TrialBlockReason;
use crate::store::TrialStore;

/// Best-effort client identity derived from network address and device signal
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientFingerprint(String);

impl ClientFingerprint {
    /// Hash the address and device signal (e.g. user agent) together
    pub fn derive(address: &str, device_signal: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(address.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(device_signal.trim().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a trial check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reason: Option<TrialBlockReason>,
}

/// Per-(fingerprint, resource) free usage gate
pub struct TrialGuard<S: TrialStore + ?Sized> {
    store: Arc<S>,
    config: TrialConfig,
}

impl<S: TrialStore + ?Sized> TrialGuard<S> {
    pub const fn new(store: Arc<S>, config: TrialConfig) -> Self {
        Self { store, config }
    }

    pub const fn config(&self) -> &TrialConfig {
        &self.config
    }

    /// Consume one free use if the trial is still open
    pub fn check_and_consume(
        &self,
        fingerprint: &ClientFingerprint,
        resource_id: &str,
    ) -> Result<TrialDecision> {
        self.check_and_consume_at(fingerprint, resource_id, Utc::now())
    }

    /// [`Self::check_and_consume`] at an explicit instant
    pub fn check_and_consume_at(
        &self,
        fingerprint: &ClientFingerprint,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialDecision> {
        let consumed = self.store.consume(
            fingerprint.as_str(),
            resource_id,
            self.config.query_limit,
            self.config.window,
            now,
        )?;

        if let Some(reason) = consumed.reason {
            tracing::debug!(fingerprint = %fingerprint, resource_id, %reason, "Trial denied");
        }

        Ok(TrialDecision {
            allowed: consumed.allowed,
            remaining: consumed.remaining,
            reason: consumed.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, SqliteLedgerStore};
    use chrono::TimeDelta;

    fn fp() -> ClientFingerprint {
        ClientFingerprint::derive("203.0.113.7", "Mozilla/5.0")
    }

    fn run_exhaustion<S: TrialStore>(store: S) {
        let guard = TrialGuard::new(Arc::new(store), TrialConfig::default());

        for expected in [2, 1, 0] {
            let decision = guard.check_and_consume(&fp(), "agent_writer").unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.reason, None);
        }

        let denied = guard.check_and_consume(&fp(), "agent_writer").unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reason, Some(TrialBlockReason::Exhausted));
    }

    #[test]
    fn test_trial_exhaustion_memory() {
        run_exhaustion(MemoryLedgerStore::new());
    }

    #[test]
    fn test_trial_exhaustion_sqlite() {
        run_exhaustion(SqliteLedgerStore::in_memory().unwrap());
    }

    #[test]
    fn test_trial_expires_and_stays_expired() {
        let guard = TrialGuard::new(
            Arc::new(SqliteLedgerStore::in_memory().unwrap()),
            TrialConfig::default(),
        );
        let start = Utc::now();

        assert!(guard.check_and_consume_at(&fp(), "agent_writer", start).unwrap().allowed);

        let late = start + TimeDelta::hours(25);
        let expired = guard.check_and_consume_at(&fp(), "agent_writer", late).unwrap();
        assert!(!expired.allowed);
        assert_eq!(expired.reason, Some(TrialBlockReason::Expired));

        // Going back inside the window does not resurrect the trial.
        let again = guard
            .check_and_consume_at(&fp(), "agent_writer", start + TimeDelta::hours(1))
            .unwrap();
        assert!(!again.allowed);
        assert_eq!(again.reason, Some(TrialBlockReason::Expired));
    }

    #[test]
    fn test_trials_are_per_resource() {
        let guard = TrialGuard::new(
            Arc::new(MemoryLedgerStore::new()),
            TrialConfig {
                query_limit: 1,
                ..TrialConfig::default()
            },
        );

        assert!(guard.check_and_consume(&fp(), "a").unwrap().allowed);
        assert!(!guard.check_and_consume(&fp(), "a").unwrap().allowed);
        assert!(guard.check_and_consume(&fp(), "b").unwrap().allowed);
    }

    #[test]
    fn test_never_allowed_after_denial() {
        let guard = TrialGuard::new(Arc::new(MemoryLedgerStore::new()), TrialConfig::default());
        let mut denied = false;
        for _ in 0..10 {
            let decision = guard.check_and_consume(&fp(), "r").unwrap();
            if denied {
                assert!(!decision.allowed);
            }
            denied |= !decision.allowed;
        }
        assert!(denied);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fp(), ClientFingerprint::derive(" 203.0.113.7", "Mozilla/5.0 "));
        assert_ne!(fp(), ClientFingerprint::derive("203.0.113.8", "Mozilla/5.0"));
        assert_eq!(fp().as_str().len(), 64);
    }
}

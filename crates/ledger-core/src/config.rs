//! Ledger Configuration

use std::time::Duration;

use chrono::TimeDelta;

/// Trial guard configuration
#[derive(Clone, Debug)]
pub struct TrialConfig {
    /// Free queries per (fingerprint, resource)
    pub query_limit: u32,

    /// How long a trial stays open after first use
    pub window: TimeDelta,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            query_limit: 3,
            window: TimeDelta::hours(24),
        }
    }
}

/// Retry policy for ledger writes made by the execution gate
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based), doubling each time
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Core ledger configuration
#[derive(Clone, Debug, Default)]
pub struct LedgerConfig {
    pub trial: TrialConfig,
    pub retry: RetryConfig,
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let query_limit = env_parse("TRIAL_QUERY_LIMIT").unwrap_or(defaults.trial.query_limit);
        let window = env_parse::<i64>("TRIAL_WINDOW_HOURS")
            .map_or(defaults.trial.window, TimeDelta::hours);
        let max_retries = env_parse("GATE_MAX_RETRIES").unwrap_or(defaults.retry.max_retries);
        let base_delay = env_parse("GATE_RETRY_BASE_MS")
            .map_or(defaults.retry.base_delay, Duration::from_millis);

        Self {
            trial: TrialConfig { query_limit, window },
            retry: RetryConfig {
                max_retries,
                base_delay,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

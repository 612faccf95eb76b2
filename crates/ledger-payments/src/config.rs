//! Payments Configuration

use std::time::Duration;

/// Checkout and webhook settings
#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    /// Smallest purchase accepted at checkout, in cents
    pub min_purchase_cents: i64,

    /// Upper bound on the outbound checkout call
    pub checkout_timeout: Duration,

    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance: Duration,

    /// Upper bound on webhook storage work before answering "retry later"
    pub webhook_processing_timeout: Duration,

    pub success_url: String,
    pub cancel_url: String,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            min_purchase_cents: 500,
            checkout_timeout: Duration::from_secs(10),
            webhook_tolerance: Duration::from_secs(300),
            webhook_processing_timeout: Duration::from_secs(10),
            success_url: "http://localhost:3000/billing/success".into(),
            cancel_url: "http://localhost:3000/billing".into(),
        }
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map_or(default, Duration::from_secs)
        };

        Self {
            min_purchase_cents: std::env::var("MIN_PURCHASE_CENTS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.min_purchase_cents),
            checkout_timeout: secs("CHECKOUT_TIMEOUT_SECS", defaults.checkout_timeout),
            webhook_tolerance: secs("WEBHOOK_TOLERANCE_SECS", defaults.webhook_tolerance),
            webhook_processing_timeout: secs(
                "WEBHOOK_PROCESSING_TIMEOUT_SECS",
                defaults.webhook_processing_timeout,
            ),
            success_url: std::env::var("CHECKOUT_SUCCESS_URL").unwrap_or(defaults.success_url),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL").unwrap_or(defaults.cancel_url),
        }
    }
}

//! Payment Gateway Adapter

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ledger_core::AccountId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::plan::Plan;

/// Request to create a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Account that receives the credits
    pub account_id: AccountId,

    /// Plan to purchase
    pub plan: Plan,

    /// URL to redirect after successful payment
    pub success_url: String,

    /// URL to redirect if checkout is cancelled
    pub cancel_url: String,

    /// Prefills the hosted checkout form
    #[serde(default)]
    pub customer_email: Option<String>,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Gateway session ID
    pub session_id: String,

    /// URL to redirect user to
    pub checkout_url: String,

    pub expires_at: DateTime<Utc>,
    pub plan: Plan,
    pub account_id: AccountId,
}

/// Outbound side of a payment provider.
///
/// Implementations create hosted checkout sessions and nothing else: credits
/// are granted only when the provider's signed webhook arrives.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;

    /// Provider name for logs and health output
    fn name(&self) -> &'static str;
}

/// Offline gateway for development and tests
#[derive(Clone, Debug, Default)]
pub struct MockGateway {
    base_url: Option<String>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkout URLs are built under `base_url`
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: Some(base_url.into()) }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let session_id = format!("cs_mock_{}", Uuid::new_v4().simple());
        let base = self.base_url.as_deref().unwrap_or("https://checkout.invalid");

        tracing::debug!(
            session_id = %session_id,
            account_id = %request.account_id,
            plan = %request.plan,
            "Created mock checkout session"
        );

        Ok(CheckoutSession {
            checkout_url: format!("{base}/pay/{session_id}"),
            session_id,
            expires_at: Utc::now() + TimeDelta::hours(1),
            plan: request.plan,
            account_id: request.account_id.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

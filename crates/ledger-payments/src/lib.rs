//! # ledger-payments
//!
//! Buying credits: Stripe hosted checkout on the way out, signed webhooks on
//! the way back in.
//!
//! ```text
//! ┌─────────────┐  checkout   ┌─────────────────┐  webhook   ┌───────────────────┐
//! │  Customer   │────────────▶│  Stripe Hosted  │───────────▶│ WebhookReconciler │
//! │  (account)  │             │  Checkout Page  │  (signed)  │  → LedgerStore    │
//! └─────────────┘             └─────────────────┘            └───────────────────┘
//! ```
//!
//! Checkout never writes to the ledger. Credits are granted only by a
//! verified `checkout.session.completed` / `invoice.paid` notification, and
//! each gateway event id can produce at most one ledger entry no matter how
//! often it is delivered.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledger_payments::{CheckoutService, PaymentsConfig, Plan, StripeClient, WebhookReconciler};
//!
//! let stripe = Arc::new(StripeClient::from_env()?);
//! let config = PaymentsConfig::from_env();
//! let reconciler = WebhookReconciler::new(store.clone(), stripe.webhook_secret(), config.clone());
//! let checkout = CheckoutService::new(stripe, config);
//!
//! let session = checkout.create(&account_id, Plan::Starter, None).await?;
//! // Redirect user to: session.checkout_url
//!
//! // Later, in the webhook route:
//! let outcome = reconciler.handle_gateway_notification(&body, signature_header).await?;
//! ```

mod checkout;
mod config;
mod error;
mod gateway;
mod plan;
pub mod signature;
mod webhook;

pub use checkout::{CheckoutService, StripeClient};
pub use config::PaymentsConfig;
pub use error::{PaymentError, Result};
pub use gateway::{CheckoutRequest, CheckoutSession, MockGateway, PaymentGateway};
pub use plan::{
    BillingInterval, MAX_TOPUP_CREDITS, Plan, PlanPricing, TOPUP_CENTS_PER_CREDIT,
};
pub use webhook::WebhookReconciler;

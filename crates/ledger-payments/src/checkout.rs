//! Stripe Checkout Integration
//!
//! Hosted Checkout: the customer is redirected to Stripe and back. Nothing
//! here writes to the ledger; credits arrive through the signed webhook.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ledger_core::AccountId;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
    CreateCheckoutSessionPaymentIntentData, CreateCheckoutSessionSubscriptionData, Currency,
};

use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::gateway::{CheckoutRequest, CheckoutSession, PaymentGateway};
use crate::plan::{BillingInterval, Plan};

/// Hosted sessions expire after this long
const SESSION_LIFETIME_MINUTES: i64 = 60;

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
    webhook_secret: String,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| PaymentError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| PaymentError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self::new(&secret_key, &webhook_secret))
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }
}

/// Metadata attached to the session (and the subscription, for renewals)
fn session_metadata(account_id: &AccountId, plan: Plan) -> HashMap<String, String> {
    HashMap::from([
        ("account_id".to_string(), account_id.to_string()),
        ("plan".to_string(), plan.as_metadata()),
    ])
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let pricing = request.plan.pricing();
        let metadata = session_metadata(&request.account_id, request.plan);
        let expires_at = Utc::now() + TimeDelta::minutes(SESSION_LIFETIME_MINUTES);

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.customer_email = request.customer_email.as_deref();
        params.client_reference_id = Some(request.account_id.as_str());
        params.expires_at = Some(expires_at.timestamp());
        params.metadata = Some(metadata.clone());

        let recurring = match pricing.interval {
            BillingInterval::OneTime => {
                params.mode = Some(CheckoutSessionMode::Payment);
                params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
                None
            }
            BillingInterval::Monthly => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
                Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                    interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                    interval_count: Some(1),
                })
            }
        };

        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                unit_amount: Some(pricing.cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: pricing.name.clone(),
                    description: Some(pricing.description.clone()),
                    ..Default::default()
                }),
                recurring,
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| PaymentError::Stripe(e.to_string()))?;

        let checkout_url = session
            .url
            .ok_or_else(|| PaymentError::Stripe("No checkout URL returned".into()))?;

        Ok(CheckoutSession {
            session_id: session.id.to_string(),
            checkout_url,
            expires_at: DateTime::from_timestamp(session.expires_at, 0).unwrap_or(expires_at),
            plan: request.plan,
            account_id: request.account_id.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

/// Checkout entry point: validates the purchase and bounds the gateway call
pub struct CheckoutService<G: PaymentGateway + ?Sized> {
    gateway: Arc<G>,
    config: PaymentsConfig,
}

impl<G: PaymentGateway + ?Sized> CheckoutService<G> {
    pub const fn new(gateway: Arc<G>, config: PaymentsConfig) -> Self {
        Self { gateway, config }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    /// Create a hosted checkout session for `plan`.
    ///
    /// On `Timeout` the session may or may not exist at the gateway; it is
    /// harmless either way because no credits move until the webhook.
    pub async fn create(
        &self,
        account_id: &AccountId,
        plan: Plan,
        customer_email: Option<String>,
    ) -> Result<CheckoutSession> {
        let cents = plan.pricing().cents;
        if cents < self.config.min_purchase_cents {
            return Err(PaymentError::BelowMinimum {
                cents,
                minimum: self.config.min_purchase_cents,
            });
        }

        let request = CheckoutRequest {
            account_id: account_id.clone(),
            plan,
            success_url: self.config.success_url.clone(),
            cancel_url: self.config.cancel_url.clone(),
            customer_email,
        };

        let session = tokio::time::timeout(
            self.config.checkout_timeout,
            self.gateway.create_checkout_session(&request),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                account_id = %account_id,
                plan = %plan,
                gateway = self.gateway.name(),
                "Checkout session creation timed out"
            );
            PaymentError::Timeout("checkout session creation".into())
        })??;

        tracing::info!(
            account_id = %account_id,
            plan = %plan,
            session_id = %session.session_id,
            gateway = self.gateway.name(),
            "Created checkout session"
        );

        Ok(session)
    }
}

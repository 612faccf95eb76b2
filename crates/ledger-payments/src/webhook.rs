//! Stripe Webhook Handling
//!
//! Turns signed gateway notifications into ledger credits, at most once per
//! event id. Deduplication lives in the store's uniqueness constraints, so
//! concurrent or cross-process redeliveries of one event cannot double-credit.

use std::sync::Arc;

use chrono::Utc;
use ledger_core::{
    AccountId, LedgerStore, NewEntry, WebhookApplication, WebhookOutcome, WebhookRecord,
};
use serde_json::Value;

use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::plan::Plan;
use crate::signature;

/// What an event means for the ledger
#[derive(Debug)]
enum Classification {
    /// Payment succeeded; credit the account
    Credit(NewEntry),

    /// Recognized, but another event carries (or carried) the credit
    Acknowledge,

    /// Payment failed; nothing to write beyond the dedup row
    PaymentFailed { account_id: Option<String> },

    Unhandled,
}

/// Applies verified gateway notifications to the ledger
pub struct WebhookReconciler<S: LedgerStore + ?Sized + 'static> {
    store: Arc<S>,
    webhook_secret: String,
    config: PaymentsConfig,
}

impl<S: LedgerStore + ?Sized + 'static> WebhookReconciler<S> {
    pub fn new(store: Arc<S>, webhook_secret: impl Into<String>, config: PaymentsConfig) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            config,
        }
    }

    /// Verify, classify and record one notification.
    ///
    /// Every outcome, including duplicates and unhandled types, is a success
    /// the caller should acknowledge. Only `InvalidSignature` and
    /// `WebhookParse` are permanent rejections.
    pub async fn handle_gateway_notification(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome> {
        if let Err(err) = signature::verify(
            raw_payload,
            signature_header,
            &self.webhook_secret,
            self.config.webhook_tolerance,
            Utc::now(),
        ) {
            tracing::warn!(
                target: "audit",
                error = %err,
                "Rejected webhook with invalid signature"
            );
            return Err(err);
        }

        let event: Value = serde_json::from_slice(raw_payload)
            .map_err(|e| reject(format!("invalid JSON: {e}")))?;
        let event_id = event
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| reject("missing event id".into()))?
            .to_string();
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| reject(format!("event {event_id} has no type")))?
            .to_string();
        let object = event
            .pointer("/data/object")
            .filter(|o| o.is_object())
            .ok_or_else(|| reject(format!("event {event_id} has no data.object")))?;

        let classification = classify(&event_id, &event_type, object).inspect_err(|err| {
            tracing::warn!(
                target: "audit",
                event_id = %event_id,
                event_type = %event_type,
                error = %err,
                "Rejected webhook payload"
            );
        })?;

        let (outcome, entry) = match classification {
            Classification::Credit(entry) => (WebhookOutcome::Applied, Some(entry)),
            Classification::Acknowledge => (WebhookOutcome::Applied, None),
            Classification::PaymentFailed { account_id } => {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    account_id = ?account_id,
                    "Gateway reported a failed payment"
                );
                (WebhookOutcome::Applied, None)
            }
            Classification::Unhandled => {
                tracing::debug!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Unhandled webhook event"
                );
                (WebhookOutcome::IgnoredUnhandledType, None)
            }
        };

        let record = WebhookRecord::new(event_id.clone(), event_type.clone(), outcome);
        let application = self.apply(record, entry).await?;

        match application {
            WebhookApplication::Duplicate => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook ignored"
                );
                Ok(WebhookOutcome::IgnoredDuplicate)
            }
            WebhookApplication::Recorded { record, entry } => {
                if let Some(entry) = entry {
                    tracing::info!(
                        target: "audit",
                        event_id = %event_id,
                        account_id = %entry.account_id,
                        credits = entry.amount,
                        kind = %entry.kind,
                        entry_id = %entry.entry_id,
                        "Credits granted from gateway payment"
                    );
                }
                Ok(record.outcome)
            }
        }
    }

    /// Store the dedup row and entry on the blocking pool, bounded in time
    async fn apply(
        &self,
        record: WebhookRecord,
        entry: Option<NewEntry>,
    ) -> Result<WebhookApplication> {
        let store = self.store.clone();
        let event_id = record.event_id.clone();
        let task = tokio::task::spawn_blocking(move || store.apply_webhook(record, entry));

        match tokio::time::timeout(self.config.webhook_processing_timeout, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join)) => {
                let err = ledger_core::LedgerError::Storage(format!("webhook task failed: {join}"));
                Err(err.into())
            }
            Err(_) => {
                tracing::warn!(event_id = %event_id, "Webhook processing timed out");
                Err(PaymentError::Timeout(format!("processing webhook {event_id}")))
            }
        }
    }
}

fn reject(message: String) -> PaymentError {
    tracing::warn!(target: "audit", error = %message, "Rejected webhook payload");
    PaymentError::WebhookParse(message)
}

fn classify(event_id: &str, event_type: &str, object: &Value) -> Result<Classification> {
    match event_type {
        "checkout.session.completed" => {
            let status = object.get("payment_status").and_then(Value::as_str).unwrap_or_default();
            if matches!(status, "paid" | "no_payment_required") {
                credit(event_id, object, CreditKind::Purchase)
            } else {
                // Delayed payment methods settle later with async_payment_succeeded
                Ok(Classification::Acknowledge)
            }
        }
        "checkout.session.async_payment_succeeded" => {
            credit(event_id, object, CreditKind::Purchase)
        }
        "invoice.paid" => {
            let reason = object.get("billing_reason").and_then(Value::as_str).unwrap_or_default();
            if reason == "subscription_create" {
                // The first period is credited by checkout.session.completed
                Ok(Classification::Acknowledge)
            } else {
                credit(event_id, object, CreditKind::SubscriptionGrant)
            }
        }
        "invoice.payment_succeeded" => Ok(Classification::Acknowledge),
        "invoice.payment_failed"
        | "payment_intent.payment_failed"
        | "checkout.session.async_payment_failed" => Ok(Classification::PaymentFailed {
            account_id: metadata_value(object, "account_id")
                .or_else(|| string_field(object, "client_reference_id")),
        }),
        _ => Ok(Classification::Unhandled),
    }
}

#[derive(Clone, Copy)]
enum CreditKind {
    Purchase,
    SubscriptionGrant,
}

fn credit(event_id: &str, object: &Value, kind: CreditKind) -> Result<Classification> {
    let account_id = metadata_value(object, "account_id")
        .or_else(|| string_field(object, "client_reference_id"))
        .ok_or_else(|| {
            PaymentError::WebhookParse(format!("event {event_id} has no account_id"))
        })?;
    let plan = metadata_value(object, "plan")
        .ok_or_else(|| PaymentError::WebhookParse(format!("event {event_id} has no plan")))?;
    let plan = Plan::parse(&plan)
        .map_err(|e| PaymentError::WebhookParse(format!("event {event_id}: {e}")))?;

    let pricing = plan.pricing();
    let account_id = AccountId::from_string(account_id);
    let entry = match kind {
        CreditKind::Purchase => NewEntry::purchase(
            account_id,
            pricing.credits,
            format!("{} purchase", pricing.name),
            event_id,
        ),
        CreditKind::SubscriptionGrant => NewEntry::subscription_grant(
            account_id,
            pricing.credits,
            format!("{} renewal", pricing.name),
            event_id,
        ),
    };

    Ok(Classification::Credit(entry))
}

/// Look up `key` in subscription metadata first, then the object's own
fn metadata_value(object: &Value, key: &str) -> Option<String> {
    ["/subscription_details/metadata", "/metadata"]
        .iter()
        .filter_map(|path| object.pointer(path))
        .find_map(|metadata| string_field(metadata, key))
}

fn string_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

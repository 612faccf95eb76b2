//! Payment Error Types

use ledger_core::LedgerError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Stripe API error
    #[error("Stripe error: {0}")]
    Stripe(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    InvalidSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Unknown or malformed plan descriptor
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Purchase amount under the configured minimum
    #[error("Purchase of {cents} cents is below the minimum of {minimum} cents")]
    BelowMinimum { cents: i64, minimum: i64 },

    /// Operation did not finish in time; its effect is unknown
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Ledger write failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Stripe(_) | Self::Timeout(_) => true,
            Self::Ledger(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Signature and payload failures are permanent and must not be retried
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidSignature(_) | Self::WebhookParse(_))
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::Stripe(_) => "Payment processing failed. Please try again.",
            Self::InvalidPlan(_) => "That plan is not available.",
            Self::BelowMinimum { .. } => "The purchase amount is below the minimum.",
            Self::Timeout(_) => {
                "The payment provider did not respond in time. Please check your purchases before retrying."
            }
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

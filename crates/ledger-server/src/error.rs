//! HTTP Error Mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ledger_core::{ExecutionError, LedgerError};
use ledger_payments::PaymentError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<i64>,
}

/// Errors surfaced by route handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid admin token")]
    Unauthorized,

    #[error("Admin routes are disabled")]
    AdminDisabled,

    #[error("Payments not configured")]
    PaymentsDisabled,

    #[error("Internal error: {0}")]
    Internal(String),
}

fn ledger_status(err: &LedgerError) -> (StatusCode, &'static str) {
    match err {
        LedgerError::InsufficientCredits { .. } => {
            (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS")
        }
        LedgerError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
        LedgerError::AccountInactive(_) => (StatusCode::FORBIDDEN, "ACCOUNT_INACTIVE"),
        LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
        LedgerError::ConstraintViolation(_) => (StatusCode::CONFLICT, "CONFLICT"),
        LedgerError::TransientStorage(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_BUSY"),
        LedgerError::Storage(_) | LedgerError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
        }
    }
}

fn payment_status(err: &PaymentError) -> (StatusCode, &'static str) {
    match err {
        PaymentError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
        PaymentError::WebhookParse(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
        PaymentError::InvalidPlan(_) => (StatusCode::BAD_REQUEST, "INVALID_PLAN"),
        PaymentError::BelowMinimum { .. } => (StatusCode::BAD_REQUEST, "BELOW_MINIMUM"),
        PaymentError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "TIMEOUT"),
        PaymentError::Stripe(_) => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR"),
        PaymentError::Ledger(e) => ledger_status(e),
        PaymentError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Ledger(e) | Self::Execution(ExecutionError::Ledger(e)) => ledger_status(e),
            Self::Execution(ExecutionError::ActionFailed { .. }) => {
                (StatusCode::BAD_GATEWAY, "ACTION_FAILED")
            }
            Self::Execution(ExecutionError::RefundFailed { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "REFUND_FAILED")
            }
            Self::Payment(e) => payment_status(e),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::AdminDisabled => (StatusCode::FORBIDDEN, "ADMIN_DISABLED"),
            Self::PaymentsDisabled => (StatusCode::SERVICE_UNAVAILABLE, "PAYMENTS_DISABLED"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(code, error = %self, "Request failed");
        }

        let (balance, required) = match &self {
            Self::Ledger(LedgerError::InsufficientCredits { balance, required, .. })
            | Self::Execution(ExecutionError::Ledger(LedgerError::InsufficientCredits {
                balance,
                required,
                ..
            })) => (Some(*balance), Some(*required)),
            _ => (None, None),
        };

        let error = match &self {
            Self::Ledger(e) => e.user_message(),
            Self::Execution(e) => e.user_message(),
            Self::Payment(e) => e.user_message().to_string(),
            Self::Internal(_) => "An internal error occurred.".into(),
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.into(),
                balance,
                required,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::AccountId;

    #[test]
    fn test_insufficient_credits_is_payment_required() {
        let err = ApiError::from(LedgerError::InsufficientCredits {
            account: AccountId::from_string("acct_1"),
            balance: 10,
            required: 15,
        });
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_webhook_status_mapping() {
        let rejected = ApiError::from(PaymentError::InvalidSignature("bad".into()));
        assert_eq!(rejected.into_response().status(), StatusCode::BAD_REQUEST);

        let busy = ApiError::from(PaymentError::Ledger(LedgerError::TransientStorage(
            "locked".into(),
        )));
        assert_eq!(busy.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout = ApiError::from(PaymentError::Timeout("webhook".into()));
        assert_eq!(timeout.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

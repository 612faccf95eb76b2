//! Application State

use std::sync::Arc;

use ledger_core::{BalanceResolver, ExecutionGate, SqliteLedgerStore, TrialGuard};
use ledger_payments::{CheckoutService, PaymentGateway, WebhookReconciler};

use crate::config::ServerConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Ledger, webhook dedup and trial storage
    pub store: Arc<SqliteLedgerStore>,

    pub resolver: BalanceResolver<SqliteLedgerStore>,
    pub gate: Arc<ExecutionGate<SqliteLedgerStore>>,
    pub trials: Arc<TrialGuard<SqliteLedgerStore>>,

    /// Checkout (optional - None if payments are not configured)
    pub checkout: Option<Arc<CheckoutService<dyn PaymentGateway>>>,

    /// Webhook reconciler (optional - None if payments are not configured)
    pub reconciler: Option<Arc<WebhookReconciler<SqliteLedgerStore>>>,

    pub config: Arc<ServerConfig>,
}

//! credit-ledger HTTP Server
//!
//! Axum-based server exposing accounts, balances, paid agent runs, trials,
//! Stripe checkout and the Stripe webhook.

mod agents;
mod config;
mod error;
mod handlers;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ledger_core::{BalanceResolver, ExecutionGate, LedgerConfig, SqliteLedgerStore, TrialGuard};
use ledger_payments::{
    CheckoutService, PaymentGateway, PaymentsConfig, StripeClient, WebhookReconciler,
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::filter_fn, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::ServerConfig;
use crate::state::AppState;

/// Operational logs go to stdout, the `audit` target to stderr
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter_fn(|meta| meta.target() != "audit")),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter_fn(|meta| meta.target() == "audit")),
        )
        .init();
}

/// Periodically compare cached balances with the ledger
fn spawn_reconciliation(resolver: BalanceResolver<SqliteLedgerStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let resolver = resolver.clone();
            match tokio::task::spawn_blocking(move || resolver.reconcile_all()).await {
                Ok(Ok(report)) if !report.is_clean() => {
                    tracing::warn!(mismatches = report.mismatches.len(), "Balance drift detected");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Balance reconciliation failed: {}", e),
                Err(e) => tracing::error!("Balance reconciliation task panicked: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::from_env();
    let ledger_config = LedgerConfig::from_env();
    let payments_config = PaymentsConfig::from_env();

    // Storage
    let store = Arc::new(if config.database_path == ":memory:" {
        tracing::warn!("Using in-memory database - ledger will not survive restart");
        SqliteLedgerStore::in_memory()?
    } else {
        SqliteLedgerStore::open(Path::new(&config.database_path))?
    });
    tracing::info!(path = %config.database_path, "Ledger store ready");

    // Payments
    let (checkout, reconciler) = match StripeClient::from_env() {
        Ok(stripe) => {
            tracing::info!("✓ Stripe configured");
            let reconciler = WebhookReconciler::new(
                store.clone(),
                stripe.webhook_secret(),
                payments_config.clone(),
            );
            let gateway: Arc<dyn PaymentGateway> = Arc::new(stripe);
            (
                Some(Arc::new(CheckoutService::new(gateway, payments_config))),
                Some(Arc::new(reconciler)),
            )
        }
        Err(e) => {
            tracing::warn!("⚠ Stripe not configured - payments disabled ({})", e);
            tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
            (None, None)
        }
    };

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set - admin routes disabled");
    }

    // Build application state
    let resolver = BalanceResolver::new(store.clone());
    let state = AppState {
        resolver: resolver.clone(),
        gate: Arc::new(ExecutionGate::new(store.clone(), ledger_config.retry)),
        trials: Arc::new(TrialGuard::new(store.clone(), ledger_config.trial)),
        checkout,
        reconciler,
        config: Arc::new(config.clone()),
        store,
    };

    spawn_reconciliation(resolver, config.reconcile_interval);

    let app = routes::app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("credit-ledger server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

//! HTTP Handlers

use std::net::SocketAddr;

use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode, header::USER_AGENT},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use ledger_core::{
    Account, AccountId, ClientFingerprint, LedgerEntry, LedgerPage, LedgerQuery, LedgerStore,
    ReconciliationReport, TrialBlockReason, WebhookOutcome, store::DEFAULT_PAGE_SIZE,
};
use ledger_payments::Plan;
use serde::{Deserialize, Serialize};

use crate::agents::AgentTemplate;
use crate::error::{ApiError, ErrorResponse};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub payments_configured: bool,
    pub gateway: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAccountRequest {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BalanceParams {
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub balance: i64,
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct LedgerParams {
    #[serde(default)]
    pub after: Option<i64>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub amount: i64,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub account_id: String,
    pub input: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub agent_id: &'static str,
    pub output: String,
    pub cost: i64,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct TrialResponse {
    pub allowed: bool,
    pub remaining: u32,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub account_id: String,
    pub plan: Plan,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub outcome: WebhookOutcome,
}

// ============================================================================
// Helpers
// ============================================================================

/// Run a blocking ledger call off the async executor
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ledger_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("ledger task failed: {e}")))?
        .map_err(ApiError::from)
}

fn parse_account_id(raw: &str) -> ApiResult<AccountId> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > 128 {
        return Err(ApiError::BadRequest("account_id must be 1-128 characters".into()));
    }
    Ok(AccountId::from_string(raw))
}

async fn existing_account(state: &AppState, account_id: &AccountId) -> ApiResult<Account> {
    let store = state.store.clone();
    let id = account_id.clone();
    blocking(move || store.account(&id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Account {account_id} not found")))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let expected = state.config.admin_token.as_deref().ok_or(ApiError::AdminDisabled)?;
    let provided = headers.get("x-admin-token").and_then(|v| v.to_str().ok());

    if provided == Some(expected) {
        Ok(())
    } else {
        tracing::warn!(target: "audit", "Admin request with missing or invalid token");
        Err(ApiError::Unauthorized)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        payments_configured: state.checkout.is_some(),
        gateway: state.checkout.as_ref().map(|c| c.gateway_name()),
    })
}

pub async fn register_account(
    State(state): State<AppState>,
    Json(payload): Json<RegisterAccountRequest>,
) -> ApiResult<(StatusCode, Json<Account>)> {
    let account_id = parse_account_id(&payload.account_id)?;
    let store = state.store.clone();
    let account = blocking(move || store.register_account(&account_id)).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn deactivate_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Account>> {
    let account_id = parse_account_id(&id)?;
    let store = state.store.clone();
    let account = blocking(move || store.deactivate_account(&account_id)).await?;
    tracing::info!(target: "audit", account_id = %account.account_id, "Account deactivated");
    Ok(Json(account))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<BalanceParams>,
) -> ApiResult<Json<BalanceResponse>> {
    let account_id = parse_account_id(&id)?;
    existing_account(&state, &account_id).await?;

    let as_of = params.as_of;
    let resolver = state.resolver.clone();
    let id = account_id.clone();
    let balance = blocking(move || match as_of {
        Some(at) => resolver.get_balance_as_of(&id, at),
        None => resolver.get_balance(&id),
    })
    .await?;

    Ok(Json(BalanceResponse {
        account_id,
        balance,
        as_of,
    }))
}

pub async fn list_ledger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LedgerParams>,
) -> ApiResult<Json<LedgerPage>> {
    let account_id = parse_account_id(&id)?;
    existing_account(&state, &account_id).await?;

    let mut query = LedgerQuery::page(params.after, params.limit.unwrap_or(DEFAULT_PAGE_SIZE));
    query.since = params.since;

    let resolver = state.resolver.clone();
    let page = blocking(move || resolver.list_ledger(&account_id, &query)).await?;
    Ok(Json(page))
}

pub async fn create_adjustment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<AdjustmentRequest>,
) -> ApiResult<(StatusCode, Json<LedgerEntry>)> {
    require_admin(&state, &headers)?;
    let account_id = parse_account_id(&id)?;
    existing_account(&state, &account_id).await?;

    let resolver = state.resolver.clone();
    let entry =
        blocking(move || resolver.adjust(&account_id, payload.amount, &payload.description))
            .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Run a paid agent: debit, render, refund on failure
pub async fn execute_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    let agent = AgentTemplate::find(&agent_id)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown agent {agent_id}")))?;
    let account_id = parse_account_id(&payload.account_id)?;
    existing_account(&state, &account_id).await?;

    let input = payload.input;
    let output = state
        .gate
        .reserve_and_execute(&account_id, agent.cost, agent.id, move || async move {
            agent.run(&input)
        })
        .await?;

    let resolver = state.resolver.clone();
    let balance = blocking(move || resolver.get_balance(&account_id)).await?;

    Ok(Json(ExecuteResponse {
        agent_id: agent.id,
        output,
        cost: agent.cost,
        balance,
    }))
}

/// Consume one free use of `resource_id` for the calling client
pub async fn trial_check(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let device = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or_default();
    let fingerprint = ClientFingerprint::derive(&peer.ip().to_string(), device);

    let trials = state.trials.clone();
    let decision = blocking(move || trials.check_and_consume(&fingerprint, &resource_id)).await?;

    if decision.allowed {
        return Ok(Json(TrialResponse {
            allowed: true,
            remaining: decision.remaining,
        })
        .into_response());
    }

    let (error, code) = match decision.reason {
        Some(TrialBlockReason::Expired) => ("The free trial window has ended.", "TRIAL_EXPIRED"),
        _ => ("All free uses have been consumed.", "TRIAL_EXHAUSTED"),
    };
    Ok((
        StatusCode::PAYMENT_REQUIRED,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
            balance: None,
            required: None,
        }),
    )
        .into_response())
}

/// Create a hosted checkout session
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let checkout = state.checkout.as_ref().ok_or(ApiError::PaymentsDisabled)?;
    let account_id = parse_account_id(&payload.account_id)?;

    let session = checkout.create(&account_id, payload.plan, payload.email).await?;

    Ok(Json(CheckoutResponse {
        checkout_url: session.checkout_url,
        session_id: session.session_id,
        expires_at: session.expires_at,
    }))
}

/// Stripe webhook handler
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let reconciler = state.reconciler.as_ref().ok_or(ApiError::PaymentsDisabled)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe signature".into()))?;

    let outcome = reconciler.handle_gateway_notification(&body, signature).await?;
    Ok(Json(WebhookResponse { outcome }))
}

/// Compare every cached balance with its ledger
pub async fn reconcile_now(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ReconciliationReport>> {
    require_admin(&state, &headers)?;
    let resolver = state.resolver.clone();
    let report = blocking(move || resolver.reconcile_all()).await?;
    Ok(Json(report))
}

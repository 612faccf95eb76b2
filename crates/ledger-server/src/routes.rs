//! Router

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    create_adjustment, create_checkout, deactivate_account, execute_agent, get_balance,
    health_check, list_ledger, reconcile_now, register_account, stripe_webhook, trial_check,
};
use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))

        // Accounts & ledger
        .route("/api/accounts", post(register_account))
        .route("/api/accounts/{id}/deactivate", post(deactivate_account))
        .route("/api/accounts/{id}/balance", get(get_balance))
        .route("/api/accounts/{id}/ledger", get(list_ledger))
        .route("/api/accounts/{id}/adjustments", post(create_adjustment))

        // Paid and free usage
        .route("/api/agents/{agent_id}/execute", post(execute_agent))
        .route("/api/trial/{resource_id}", post(trial_check))

        // Payments
        .route("/api/checkout", post(create_checkout))
        .route("/webhook/stripe", post(stripe_webhook))

        // Admin
        .route("/api/admin/reconcile", post(reconcile_now))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{Request, StatusCode},
    };
    use chrono::Utc;
    use ledger_core::{
        BalanceResolver, ExecutionGate, RetryConfig, SqliteLedgerStore, TrialConfig, TrialGuard,
    };
    use ledger_payments::{
        CheckoutService, MockGateway, PaymentGateway, PaymentsConfig, WebhookReconciler, signature,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::config::ServerConfig;

    const SECRET: &str = "whsec_routes";
    const ADMIN: &str = "admin-secret";

    fn test_app() -> Router {
        let store = Arc::new(SqliteLedgerStore::in_memory().unwrap());
        let gateway: Arc<dyn PaymentGateway> = Arc::new(MockGateway::new());

        let state = AppState {
            resolver: BalanceResolver::new(store.clone()),
            gate: Arc::new(ExecutionGate::new(store.clone(), RetryConfig::default())),
            trials: Arc::new(TrialGuard::new(store.clone(), TrialConfig::default())),
            checkout: Some(Arc::new(CheckoutService::new(gateway, PaymentsConfig::default()))),
            reconciler: Some(Arc::new(WebhookReconciler::new(
                store.clone(),
                SECRET,
                PaymentsConfig::default(),
            ))),
            config: Arc::new(ServerConfig {
                admin_token: Some(ADMIN.into()),
                ..ServerConfig::default()
            }),
            store,
        };

        app(state).layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 7], 50_000))))
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn webhook(event: &Value) -> Request<Body> {
        let body = event.to_string();
        let header = signature::sign(body.as_bytes(), SECRET, Utc::now().timestamp()).unwrap();
        Request::builder()
            .method("POST")
            .uri("/webhook/stripe")
            .header("stripe-signature", header)
            .body(Body::from(body))
            .unwrap()
    }

    fn purchase(event_id: &str, account: &str, plan: &str) -> Value {
        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": { "object": {
                "payment_status": "paid",
                "metadata": { "account_id": account, "plan": plan }
            } }
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn register(app: &Router, account: &str) {
        let request = post_json("/api/accounts", &json!({ "account_id": account }));
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn adjust(app: &Router, account: &str, amount: i64) -> StatusCode {
        let mut request = post_json(
            &format!("/api/accounts/{account}/adjustments"),
            &json!({ "amount": amount, "description": "support grant" }),
        );
        request.headers_mut().insert("x-admin-token", ADMIN.parse().unwrap());
        send(app, request).await.0
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payments_configured"], true);
        assert_eq!(body["gateway"], "mock");
    }

    #[tokio::test]
    async fn test_webhook_credits_once() {
        let app = test_app();
        register(&app, "acct_alice").await;

        let event = purchase("evt_1", "acct_alice", "starter");
        let (status, body) = send(&app, webhook(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");

        let (status, body) = send(&app, webhook(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored_duplicate");

        let (_, body) = send(&app, get_req("/api/accounts/acct_alice/balance")).await;
        assert_eq!(body["balance"], 500);

        let (_, body) = send(&app, get_req("/api/accounts/acct_alice/ledger")).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/webhook/stripe")
            .header("stripe-signature", "t=1,v1=00")
            .body(Body::from(purchase("evt_2", "acct_x", "pro").to_string()))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn test_insufficient_credits_is_402() {
        let app = test_app();
        register(&app, "acct_bob").await;
        assert_eq!(adjust(&app, "acct_bob", 10).await, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            post_json(
                "/api/agents/researcher/execute",
                &json!({ "account_id": "acct_bob", "input": "tides" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
        assert_eq!(body["balance"], 10);
        assert_eq!(body["required"], 20);

        let (_, body) = send(&app, get_req("/api/accounts/acct_bob/ledger")).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_agent_run_is_refunded() {
        let app = test_app();
        register(&app, "acct_carol").await;
        adjust(&app, "acct_carol", 10).await;

        let (status, body) = send(
            &app,
            post_json(
                "/api/agents/summarizer/execute",
                &json!({ "account_id": "acct_carol", "input": "  " }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "ACTION_FAILED");

        let (_, body) = send(&app, get_req("/api/accounts/acct_carol/balance")).await;
        assert_eq!(body["balance"], 10);

        let (_, body) = send(&app, get_req("/api/accounts/acct_carol/ledger")).await;
        let kinds: Vec<&str> = body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["manual_adjustment", "usage_debit", "refund"]);
    }

    #[tokio::test]
    async fn test_successful_agent_run() {
        let app = test_app();
        register(&app, "acct_dave").await;
        adjust(&app, "acct_dave", 10).await;

        let (status, body) = send(
            &app,
            post_json(
                "/api/agents/summarizer/execute",
                &json!({ "account_id": "acct_dave", "input": "hello" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "Summary of your text: hello");
        assert_eq!(body["balance"], 5);
    }

    #[tokio::test]
    async fn test_trial_limit() {
        let app = test_app();
        for expected in [2, 1, 0] {
            let (status, body) = send(&app, post_json("/api/trial/demo-agent", &json!({}))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["remaining"], expected);
        }

        let (status, body) = send(&app, post_json("/api/trial/demo-agent", &json!({}))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "TRIAL_EXHAUSTED");
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let app = test_app();
        register(&app, "acct_erin").await;

        let request = post_json(
            "/api/accounts/acct_erin/adjustments",
            &json!({ "amount": 100, "description": "no token" }),
        );
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut request = post_json("/api/admin/reconcile", &json!({}));
        request.headers_mut().insert("x-admin-token", ADMIN.parse().unwrap());
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accounts_checked"], 1);
        assert_eq!(body["mismatches"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_oversized_adjustment_is_rejected() {
        let app = test_app();
        register(&app, "acct_gil").await;
        assert_eq!(adjust(&app, "acct_gil", 10).await, StatusCode::CREATED);
        assert_eq!(adjust(&app, "acct_gil", i64::MAX).await, StatusCode::BAD_REQUEST);
        assert_eq!(adjust(&app, "acct_gil", i64::MAX).await, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, get_req("/api/accounts/acct_gil/balance")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 10);
    }

    #[tokio::test]
    async fn test_checkout() {
        let app = test_app();
        let (status, body) = send(
            &app,
            post_json("/api/checkout", &json!({ "account_id": "acct_fay", "plan": "growth" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["session_id"].as_str().unwrap().starts_with("cs_mock_"));

        let (status, body) = send(
            &app,
            post_json("/api/checkout", &json!({ "account_id": "acct_fay", "plan": "topup:5" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BELOW_MINIMUM");
    }

    #[tokio::test]
    async fn test_unknown_account_is_404() {
        let app = test_app();
        let (status, body) = send(&app, get_req("/api/accounts/nobody/balance")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let request = post_json("/api/accounts/nobody/deactivate", &json!({}));
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

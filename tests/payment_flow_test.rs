//! Payment Flow Integration Tests
//!
//! Bridge + ledger against a local fake paid API speaking the x402
//! challenge-response protocol.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use skillbridge::payments::balance::BalanceError;
use skillbridge::{
    BalanceSource, BridgeError, BudgetLedger, HmacSigner, IpcHandler, IpcRequest, PaidRequest,
    PaymentBridge, PaymentSigner, RunnerConfig, SkillLoader, SkillRunner, SpendingLimits,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// 0.05 units at 6 decimals.
const AMOUNT_MINOR: u64 = 50_000;

#[derive(Clone)]
struct AppState {
    hits: Arc<AtomicUsize>,
    amount_minor: u64,
}

fn challenge_json(amount: u64) -> String {
    format!(
        r#"{{"amount":{amount},"recipient":"0xrecipient","token":"0xtoken","nonce":"n-1","expiresAt":4102444800}}"#
    )
}

async fn free_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"tier": "free"}))
}

/// 402 until the payment proof header shows up, then 200.
async fn paid_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if headers.get("x-payment").is_some() {
        (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
    } else {
        let mut reply_headers = HeaderMap::new();
        reply_headers.insert(
            "x-payment-required",
            challenge_json(state.amount_minor).parse().unwrap(),
        );
        (StatusCode::PAYMENT_REQUIRED, reply_headers, "payment required").into_response()
    }
}

/// 402 on every request, payment proof or not.
async fn greedy_handler(State(state): State<AppState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut reply_headers = HeaderMap::new();
    reply_headers.insert(
        "x-payment-required",
        challenge_json(state.amount_minor).parse().unwrap(),
    );
    (StatusCode::PAYMENT_REQUIRED, reply_headers, "payment required").into_response()
}

async fn spawn_server(amount_minor: u64) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = AppState {
        hits: hits.clone(),
        amount_minor,
    };
    let app = Router::new()
        .route("/free", get(free_handler))
        .route("/v1/tasks", get(paid_handler))
        .route("/v1/discover", get(paid_handler))
        .route("/v1/greedy", get(greedy_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn make_ledger(
    dir: &TempDir,
    balance: Option<Arc<dyn BalanceSource>>,
    wallet: Option<&str>,
) -> Arc<BudgetLedger> {
    Arc::new(BudgetLedger::new(
        dir.path().to_path_buf(),
        SpendingLimits::default(),
        balance,
        "0xtoken".to_string(),
        wallet.map(str::to_string),
        6,
    ))
}

fn make_bridge(ledger: Arc<BudgetLedger>, with_signer: bool) -> PaymentBridge {
    let signer: Option<Arc<dyn PaymentSigner>> = if with_signer {
        Some(Arc::new(
            HmacSigner::from_hex_key("a1b2c3d4e5f6", "0xpayer".to_string()).unwrap(),
        ))
    } else {
        None
    };
    PaymentBridge::new(ledger, signer, 6)
}

fn get_request(url: String, task_id: Option<&str>) -> PaidRequest {
    PaidRequest {
        url,
        method: "GET".to_string(),
        body: None,
        headers: None,
        task_id: task_id.map(str::to_string),
    }
}

#[tokio::test]
async fn test_non_402_probe_returns_directly() {
    let (base, _) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    let bridge = make_bridge(make_ledger(&state, None, None), true);

    let response = bridge
        .execute(&get_request(format!("{base}/free"), None))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert!(!response.payment_made);
    assert!(response.payment_amount.is_none());
    assert_eq!(response.body["tier"], "free");
}

#[tokio::test]
async fn test_paid_flow_settles_and_records() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    let ledger = make_ledger(&state, None, None);
    let bridge = make_bridge(ledger.clone(), true);

    let response = bridge
        .execute(&get_request(format!("{base}/v1/tasks"), Some("t-1")))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert!(response.payment_made);
    assert_eq!(response.payment_amount.as_deref(), Some("0.050000"));
    assert_eq!(response.body["ok"], true);
    // Probe plus exactly one signed retry.
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let session = ledger.session_snapshot().await;
    assert!((session.total_spent - 0.05).abs() < 1e-9);
    assert!((session.spent_by_task["t-1"] - 0.05).abs() < 1e-9);
    assert!((session.spent_by_category["task"] - 0.05).abs() < 1e-9);
    assert_eq!(session.transactions.len(), 1);
    assert_eq!(session.transactions[0].nonce, "n-1");

    // The append-only audit file saw the same receipt.
    let receipts = fs::read_to_string(state.path().join("receipts.json")).unwrap();
    let receipts: serde_json::Value = serde_json::from_str(&receipts).unwrap();
    assert_eq!(receipts.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_budget_exceeded_before_any_retry() {
    // 2.00 units against the default 1.00 per-request ceiling.
    let (base, hits) = spawn_server(2_000_000).await;
    let state = TempDir::new().unwrap();
    let ledger = make_ledger(&state, None, None);
    let bridge = make_bridge(ledger.clone(), true);

    let err = bridge
        .execute(&get_request(format!("{base}/v1/tasks"), None))
        .await
        .unwrap_err();

    match &err {
        BridgeError::BudgetExceeded(message) => assert!(message.contains("per-request")),
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
    assert!(!err.recoverable());
    // The probe happened; no signed retry ever did.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.session_snapshot().await.total_spent, 0.0);
}

#[tokio::test]
async fn test_second_402_is_passed_through_not_honored() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    let ledger = make_ledger(&state, None, None);
    let bridge = make_bridge(ledger.clone(), true);

    let response = bridge
        .execute(&get_request(format!("{base}/v1/greedy"), None))
        .await
        .unwrap();

    // One challenge honored per request: the second 402 comes back as-is.
    assert_eq!(response.status, 402);
    assert!(response.payment_made);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_no_signer_is_fatal() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    let bridge = make_bridge(make_ledger(&state, None, None), false);

    let err = bridge
        .execute(&get_request(format!("{base}/v1/tasks"), None))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::NoSigner));
    assert!(!err.recoverable());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_network_error_is_recoverable() {
    let state = TempDir::new().unwrap();
    let bridge = make_bridge(make_ledger(&state, None, None), true);

    // Nothing listens here.
    let err = bridge
        .execute(&get_request("http://127.0.0.1:9/unreachable".to_string(), None))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Network(_)));
    assert!(err.recoverable());
}

struct FixedBalance(u128);

#[async_trait::async_trait]
impl BalanceSource for FixedBalance {
    async fn token_balance(&self, _token: &str, _owner: &str) -> Result<u128, BalanceError> {
        Ok(self.0)
    }
}

struct DownRpc;

#[async_trait::async_trait]
impl BalanceSource for DownRpc {
    async fn token_balance(&self, _token: &str, _owner: &str) -> Result<u128, BalanceError> {
        Err(BalanceError::Rpc("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_insufficient_onchain_balance() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    // 0.01 units available against a 0.05 challenge.
    let ledger = make_ledger(&state, Some(Arc::new(FixedBalance(10_000))), Some("0xwallet"));
    let bridge = make_bridge(ledger, true);

    let err = bridge
        .execute(&get_request(format!("{base}/v1/tasks"), None))
        .await
        .unwrap_err();

    match err {
        BridgeError::InsufficientFunds { needed, available } => {
            assert!((needed - 0.05).abs() < 1e-9);
            assert!((available - 0.01).abs() < 1e-9);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_balance_rpc_fails_open() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let state = TempDir::new().unwrap();
    let ledger = make_ledger(&state, Some(Arc::new(DownRpc)), Some("0xwallet"));
    let bridge = make_bridge(ledger, true);

    // Availability over safety: the payment goes through.
    let response = bridge
        .execute(&get_request(format!("{base}/v1/tasks"), None))
        .await
        .unwrap();
    assert!(response.payment_made);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spending_query_through_handler() {
    let state = TempDir::new().unwrap();
    let ledger = make_ledger(&state, None, None);
    let bridge = Arc::new(make_bridge(ledger.clone(), true));
    let handler = IpcHandler::new(bridge, ledger);

    let reply = handler
        .handle(IpcRequest::GetSessionSpending { id: 4 })
        .await;
    assert_eq!(reply["id"], 4);
    assert!(reply["spending"]["sessionId"].is_string());
    assert_eq!(reply["spending"]["limits"]["perRequest"], 1.0);
}

#[tokio::test]
async fn test_skill_step_pays_over_the_channel() {
    let (base, hits) = spawn_server(AMOUNT_MINOR).await;
    let registry = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();

    let command = format!(
        r#"echo "{{\"action\":\"x402_request\",\"id\":1,\"url\":\"{base}/v1/tasks\",\"method\":\"GET\",\"taskId\":\"t-9\"}}" >&3 && head -n 1 <&3"#
    );
    let skill_md = format!("---\nexecution:\n  - run: '{command}'\n---\n");
    let dir = registry.path().join("paid-probe");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("SKILL.md"), skill_md).unwrap();

    let ledger = make_ledger(&state, None, None);
    let bridge = Arc::new(make_bridge(ledger.clone(), true));
    let handler = Arc::new(IpcHandler::new(bridge, ledger.clone()));

    let loader = SkillLoader::new(
        cache.path().to_path_buf(),
        Some(registry.path().to_path_buf()),
        None,
    );
    let bundle = loader.load_verified("paid-probe", None).await.unwrap();
    let result = SkillRunner::new(RunnerConfig::default(), Some(handler))
        .execute(&bundle, "")
        .await
        .unwrap();

    assert_eq!(result.steps[0].exit_code, 0, "stderr: {}", result.steps[0].stderr);
    let reply: serde_json::Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["paymentMade"], true);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let session = ledger.session_snapshot().await;
    assert!((session.spent_by_task["t-9"] - 0.05).abs() < 1e-9);
}

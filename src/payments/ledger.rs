//! Budget Ledger
//!
//! Persisted, multi-scope spending tracker. Consulted by the payment
//! bridge before any payment is authorized and updated after every
//! successful one. Three ceilings apply, each independently sufficient to
//! reject: per-request, per-session, and per-task; only when all three
//! pass does the on-chain balance check run.
//!
//! Session state lives in `session_spending.json` under the state
//! directory, with a separate append-only `receipts.json` audit file.
//! A missing or unparsable session file is recovered by starting fresh,
//! never treated as fatal.

use super::balance::BalanceSource;
use super::BridgeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SESSION_FILE: &str = "session_spending.json";
const RECEIPTS_FILE: &str = "receipts.json";

/// Spending ceilings in decimal currency units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingLimits {
    pub per_request: f64,
    pub per_task: f64,
    pub per_session: f64,
}

impl Default for SpendingLimits {
    fn default() -> Self {
        Self {
            per_request: 1.0,
            per_task: 5.0,
            per_session: 20.0,
        }
    }
}

/// One recorded payment. Appended to the session object and to the
/// audit file; never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    /// Decimal currency units.
    pub amount: f64,
    pub recipient: String,
    pub nonce: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// The persisted per-session spending state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpending {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub limits: SpendingLimits,
    pub total_spent: f64,
    #[serde(default)]
    pub spent_by_category: HashMap<String, f64>,
    #[serde(default)]
    pub spent_by_task: HashMap<String, f64>,
    #[serde(default)]
    pub transactions: Vec<PaymentReceipt>,
}

/// Budget ledger over one agent session.
pub struct BudgetLedger {
    state_dir: PathBuf,
    limits: SpendingLimits,
    session: tokio::sync::Mutex<Option<SessionSpending>>,
    /// Serializes whole check-then-record payment sequences; the bridge
    /// holds this from the budget check until the receipt is persisted.
    payment_lock: tokio::sync::Mutex<()>,
    balance: Option<Arc<dyn BalanceSource>>,
    payment_token: String,
    wallet_address: Option<String>,
    token_decimals: u32,
}

impl BudgetLedger {
    pub fn new(
        state_dir: PathBuf,
        limits: SpendingLimits,
        balance: Option<Arc<dyn BalanceSource>>,
        payment_token: String,
        wallet_address: Option<String>,
        token_decimals: u32,
    ) -> Self {
        Self {
            state_dir,
            limits,
            session: tokio::sync::Mutex::new(None),
            payment_lock: tokio::sync::Mutex::new(()),
            balance,
            payment_token,
            wallet_address,
            token_decimals,
        }
    }

    /// Acquire the per-session payment lock. Held across the whole
    /// check-sign-pay-record sequence to close the race between concurrent
    /// budget checks and updates.
    pub async fn begin_payment(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.payment_lock.lock().await
    }

    /// Returns normally when the payment may proceed; otherwise fails with
    /// a specific, user-actionable error. Checks run in order: per-request,
    /// per-session, per-task, then the on-chain balance.
    pub async fn check_spending_limits(
        &self,
        amount: f64,
        task_id: Option<&str>,
    ) -> Result<(), BridgeError> {
        {
            let mut slot = self.session.lock().await;
            let session = self.session_mut(&mut slot);

            if amount > session.limits.per_request {
                return Err(BridgeError::BudgetExceeded(format!(
                    "request amount {:.4} exceeds per-request limit {:.4}",
                    amount, session.limits.per_request
                )));
            }
            if session.total_spent + amount > session.limits.per_session {
                return Err(BridgeError::BudgetExceeded(format!(
                    "session total {:.4} + {:.4} would exceed per-session limit {:.4}",
                    session.total_spent, amount, session.limits.per_session
                )));
            }
            if let Some(task) = task_id {
                let spent = session.spent_by_task.get(task).copied().unwrap_or(0.0);
                if spent + amount > session.limits.per_task {
                    return Err(BridgeError::BudgetExceeded(format!(
                        "task '{}' total {:.4} + {:.4} would exceed per-task limit {:.4}",
                        task, spent, amount, session.limits.per_task
                    )));
                }
            }
        }

        self.check_onchain_balance(amount).await
    }

    /// Balance check against the configured payment token. An unreachable
    /// RPC is treated as "assume sufficient funds" (fail-open, preserved
    /// from the source system; see DESIGN.md).
    async fn check_onchain_balance(&self, amount: f64) -> Result<(), BridgeError> {
        let (source, owner) = match (&self.balance, &self.wallet_address) {
            (Some(source), Some(owner)) => (source, owner),
            _ => return Ok(()),
        };

        match source.token_balance(&self.payment_token, owner).await {
            Ok(raw) => {
                let available = raw as f64 / 10f64.powi(self.token_decimals as i32);
                if available < amount {
                    return Err(BridgeError::InsufficientFunds {
                        needed: amount,
                        available,
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!("balance check unavailable, assuming sufficient funds: {e}");
                Ok(())
            }
        }
    }

    /// Record a successful payment: session total, endpoint category,
    /// task-scoped total, then both persisted files. Persistence failures
    /// are logged, not surfaced; the payment has already happened.
    pub async fn record_payment(&self, receipt: PaymentReceipt) {
        let mut slot = self.session.lock().await;
        let session = self.session_mut(&mut slot);

        session.total_spent += receipt.amount;
        let category = categorize_endpoint(&receipt.endpoint);
        *session
            .spent_by_category
            .entry(category.to_string())
            .or_insert(0.0) += receipt.amount;
        if let Some(ref task) = receipt.task_id {
            *session.spent_by_task.entry(task.clone()).or_insert(0.0) += receipt.amount;
        }
        session.transactions.push(receipt.clone());

        debug!(
            "recorded payment of {:.6} to {} (session total {:.6})",
            receipt.amount, receipt.endpoint, session.total_spent
        );

        if let Err(e) = persist_session(&self.state_dir, session) {
            warn!("failed to persist session spending: {e}");
        }
        if let Err(e) = append_receipt(&self.state_dir, &receipt) {
            warn!("failed to append receipt: {e}");
        }
    }

    /// Current session state, loading it on first access.
    pub async fn session_snapshot(&self) -> SessionSpending {
        let mut slot = self.session.lock().await;
        self.session_mut(&mut slot).clone()
    }

    /// Replace the session wholesale: new identifier, zeroed totals,
    /// configured limits.
    pub async fn reset_session(&self) -> SessionSpending {
        let mut slot = self.session.lock().await;
        let fresh = self.fresh_session();
        if let Err(e) = persist_session(&self.state_dir, &fresh) {
            warn!("failed to persist session spending: {e}");
        }
        *slot = Some(fresh.clone());
        info!("session spending reset, new session {}", fresh.session_id);
        fresh
    }

    fn session_mut<'a>(
        &self,
        slot: &'a mut Option<SessionSpending>,
    ) -> &'a mut SessionSpending {
        if slot.is_none() {
            *slot = Some(self.load_or_fresh());
        }
        slot.as_mut().expect("session just initialized")
    }

    fn load_or_fresh(&self) -> SessionSpending {
        let path = self.state_dir.join(SESSION_FILE);
        match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<SessionSpending>(&data) {
                Ok(session) => {
                    debug!("loaded session {} from {}", session.session_id, path.display());
                    session
                }
                Err(e) => {
                    warn!("session file unparsable ({e}), starting fresh");
                    self.fresh_session()
                }
            },
            Err(_) => self.fresh_session(),
        }
    }

    fn fresh_session(&self) -> SessionSpending {
        SessionSpending {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            limits: self.limits,
            total_spent: 0.0,
            spent_by_category: HashMap::new(),
            spent_by_task: HashMap::new(),
            transactions: Vec::new(),
        }
    }
}

/// Spending category derived from the endpoint path.
pub fn categorize_endpoint(endpoint: &str) -> &'static str {
    // Strip scheme/host so the match only sees the path.
    let path = endpoint
        .find("://")
        .and_then(|i| endpoint[i + 3..].find('/').map(|j| &endpoint[i + 3 + j..]))
        .unwrap_or(endpoint);

    if path.contains("/discover") || path.contains("/search") {
        "discovery"
    } else if path.contains("/tasks") {
        "task"
    } else if path.contains("/escrow") || path.contains("/fund") {
        "escrow"
    } else {
        "other"
    }
}

fn persist_session(state_dir: &Path, session: &SessionSpending) -> std::io::Result<()> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join(SESSION_FILE);
    let data = serde_json::to_string_pretty(session)?;
    fs::write(&path, data)?;
    restrict_permissions(&path)
}

fn append_receipt(state_dir: &Path, receipt: &PaymentReceipt) -> std::io::Result<()> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join(RECEIPTS_FILE);
    let mut receipts: Vec<PaymentReceipt> = match fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    receipts.push(receipt.clone());
    fs::write(&path, serde_json::to_string_pretty(&receipts)?)?;
    restrict_permissions(&path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

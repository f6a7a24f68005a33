//! Parent-Side IPC Loop
//!
//! One loop per running step: pull lines off the channel, dispatch each
//! parsed request to the payment bridge or the ledger, write one-line JSON
//! replies back. The loop ends when the step closes its end.

use super::{BridgeErrorResponse, IpcRequest, PaidResponseMsg};
use crate::payments::ledger::BudgetLedger;
use crate::payments::x402::{PaidRequest, PaymentBridge};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Dispatches IPC requests to the subsystems that answer them.
pub struct IpcHandler {
    bridge: Arc<PaymentBridge>,
    ledger: Arc<BudgetLedger>,
}

impl IpcHandler {
    pub fn new(bridge: Arc<PaymentBridge>, ledger: Arc<BudgetLedger>) -> Self {
        Self { bridge, ledger }
    }

    /// Handle a single request. Always yields a response value; bridge
    /// failures come back as structured error objects, never panics.
    pub async fn handle(&self, request: IpcRequest) -> Value {
        match request {
            IpcRequest::X402Request {
                id,
                url,
                method,
                body,
                task_id,
                headers,
            } => {
                let paid_request = PaidRequest {
                    url,
                    method,
                    body,
                    headers,
                    task_id,
                };
                match self.bridge.execute(&paid_request).await {
                    Ok(response) => serde_json::to_value(PaidResponseMsg {
                        id,
                        status: response.status,
                        body: response.body,
                        payment_made: response.payment_made,
                        payment_amount: response.payment_amount,
                    })
                    .unwrap_or_default(),
                    Err(err) => serde_json::to_value(err.to_response(Some(id)))
                        .unwrap_or_default(),
                }
            }
            IpcRequest::GetSessionSpending { id } => {
                let spending = self.ledger.session_snapshot().await;
                json!({ "id": id, "spending": spending })
            }
        }
    }
}

/// Serve one step's channel until the peer closes it. Requests are
/// processed in arrival order; a line that does not parse is answered
/// with a transport error object rather than dropped silently.
pub async fn serve(stream: UnixStream, handler: Arc<IpcHandler>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("IPC read error: {e}");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!("← {trimmed}");

        let reply = match serde_json::from_str::<IpcRequest>(trimmed) {
            Ok(request) => handler.handle(request).await,
            Err(e) => serde_json::to_value(BridgeErrorResponse::transport(
                None,
                format!("unparseable request: {e}"),
            ))
            .unwrap_or_default(),
        };

        let out = reply.to_string();
        debug!("→ {out}");
        if write.write_all(out.as_bytes()).await.is_err()
            || write.write_all(b"\n").await.is_err()
            || write.flush().await.is_err()
        {
            break;
        }
    }
    debug!("IPC channel closed");
}

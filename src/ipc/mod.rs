//! IPC Channel
//!
//! Out-of-band, line-delimited JSON message pipe between a sandboxed skill
//! step and the agent process, carried over a pre-opened file descriptor
//! distinct from stdin/stdout/stderr. Requests flow from the step to the
//! agent; each request carries a locally-unique integer id that the
//! matching response echoes back.
//!
//! Errors cross this boundary as structured data, never as exceptions:
//! skill code branches on the `error` field.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Descriptor number the channel is pre-opened on in skill processes.
pub const IPC_FD: i32 = 3;

/// Closed error taxonomy for the channel and the payment bridge behind it.
pub mod codes {
    pub const INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const SIGNING_FAILED: &str = "SIGNING_FAILED";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INVALID_CHALLENGE: &str = "INVALID_CHALLENGE";
    pub const NO_SIGNER: &str = "NO_SIGNER";
    pub const IPC_UNAVAILABLE: &str = "IPC_UNAVAILABLE";
    pub const IPC_TRANSPORT: &str = "IPC_TRANSPORT";
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
}

/// Inbound request from a skill step, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Metered, pay-per-call HTTP request handled by the payment bridge.
    X402Request {
        id: u64,
        url: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    /// Query the live session spending object.
    GetSessionSpending { id: u64 },
}

/// Successful paid-request reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidResponseMsg {
    pub id: u64,
    pub status: u16,
    pub body: serde_json::Value,
    #[serde(rename = "paymentMade")]
    pub payment_made: bool,
    #[serde(
        rename = "paymentAmount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub payment_amount: Option<String>,
}

/// Error reply. Payment-flow errors echo the originating request id when
/// it is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub error: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(
        rename = "suggestedAction",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub suggested_action: Option<String>,
}

impl BridgeErrorResponse {
    pub fn ipc_unavailable() -> Self {
        Self {
            id: None,
            error: codes::IPC_UNAVAILABLE.to_string(),
            message: "IPC channel unavailable; running outside the agent context".to_string(),
            recoverable: false,
            suggested_action: Some(
                "run the skill under the agent to enable paid requests".to_string(),
            ),
        }
    }

    pub fn timeout(id: Option<u64>, after: Duration) -> Self {
        Self {
            id,
            error: codes::TIMEOUT.to_string(),
            message: format!("no response within {}s", after.as_secs()),
            recoverable: true,
            suggested_action: Some("retry the request".to_string()),
        }
    }

    pub fn channel_closed(id: Option<u64>) -> Self {
        Self {
            id,
            error: codes::CHANNEL_CLOSED.to_string(),
            message: "IPC channel closed before a response arrived".to_string(),
            recoverable: true,
            suggested_action: None,
        }
    }

    pub fn transport(id: Option<u64>, message: String) -> Self {
        Self {
            id,
            error: codes::IPC_TRANSPORT.to_string(),
            message,
            recoverable: true,
            suggested_action: None,
        }
    }
}

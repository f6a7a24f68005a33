//! On-Chain Balance Source
//!
//! Reads the agent wallet's ERC-20 token balance through a plain JSON-RPC
//! `eth_call` against the configured endpoint. The ledger consults this
//! before authorizing a payment.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// `balanceOf(address)` function selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("balance rpc error: {0}")]
    Rpc(String),
    #[error("malformed balance response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Raw token balance in minor units for `owner` on `token`.
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128, BalanceError>;
}

/// JSON-RPC backed balance source.
pub struct JsonRpcBalanceSource {
    client: reqwest::Client,
    rpc_url: String,
}

impl JsonRpcBalanceSource {
    pub fn new(rpc_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url,
        }
    }
}

#[async_trait]
impl BalanceSource for JsonRpcBalanceSource {
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128, BalanceError> {
        let calldata = balance_of_calldata(owner)?;
        let body = json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{"to": token, "data": calldata}, "latest"],
            "id": 1,
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BalanceError::Rpc(e.to_string()))?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| BalanceError::Rpc(e.to_string()))?;

        if let Some(error) = value.get("error") {
            return Err(BalanceError::Rpc(error.to_string()));
        }

        let raw = value
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| BalanceError::Malformed("eth_call result was missing".to_string()))?;
        parse_hex_u128(raw)
    }
}

/// ABI-encode a `balanceOf(owner)` call: selector plus the owner address
/// left-padded to 32 bytes.
fn balance_of_calldata(owner: &str) -> Result<String, BalanceError> {
    let stripped = owner.trim().trim_start_matches("0x");
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BalanceError::Malformed(format!(
            "not a 20-byte hex address: '{owner}'"
        )));
    }
    Ok(format!("0x{BALANCE_OF_SELECTOR}{:0>64}", stripped.to_ascii_lowercase()))
}

fn parse_hex_u128(raw: &str) -> Result<u128, BalanceError> {
    let stripped = raw.trim().trim_start_matches("0x").trim_start_matches('0');
    if stripped.is_empty() {
        return Ok(0);
    }
    if stripped.len() > 32 {
        // A balance beyond u128 range is effectively unlimited here.
        return Ok(u128::MAX);
    }
    u128::from_str_radix(stripped, 16)
        .map_err(|e| BalanceError::Malformed(format!("'{raw}': {e}")))
}

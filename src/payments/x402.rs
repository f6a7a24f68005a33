//! x402 Payment Bridge
//!
//! Drives the challenge-response payment protocol for one paid HTTP
//! request: probe the endpoint unmodified, parse the payment challenge on
//! a 402, verify the budget, sign, retry once with the payment proof
//! attached, and record a receipt. Exactly one challenge is honored per
//! request; whatever the signed retry returns is passed through as-is.

use super::ledger::{BudgetLedger, PaymentReceipt};
use super::signer::PaymentSigner;
use super::BridgeError;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Challenge header on a 402 response (JSON value).
pub const PAYMENT_REQUIRED_HEADER: &str = "x-payment-required";
/// Proof header on the paid retry (signature string).
pub const PAYMENT_HEADER: &str = "x-payment";

/// Ceiling on the whole probe-through-record flow.
const FLOW_TIMEOUT_SECS: u64 = 25;
/// Per-HTTP-call ceiling within the flow.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Payment challenge parsed from a 402 response header. Ephemeral; lives
/// only for the duration of one paid-request flow.
#[derive(Debug, Clone, Deserialize)]
pub struct X402Challenge {
    /// Integer minor-unit value; some providers quote it as a string.
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: u64,
    pub recipient: String,
    pub token: String,
    pub nonce: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
    }
}

/// One paid HTTP request as received over the IPC channel.
#[derive(Debug, Clone)]
pub struct PaidRequest {
    pub url: String,
    pub method: String,
    pub body: Option<Value>,
    pub headers: Option<HashMap<String, String>>,
    pub task_id: Option<String>,
}

/// Outcome of a paid-request flow.
#[derive(Debug, Clone)]
pub struct PaidResponse {
    pub status: u16,
    pub body: Value,
    pub payment_made: bool,
    /// Decimal currency units, set only when a payment happened.
    pub payment_amount: Option<String>,
}

/// The bridge itself. One instance serves every concurrent paid flow;
/// per-flow state lives on the stack of `execute`.
pub struct PaymentBridge {
    client: reqwest::Client,
    ledger: Arc<BudgetLedger>,
    signer: Option<Arc<dyn PaymentSigner>>,
    token_decimals: u32,
}

impl PaymentBridge {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        signer: Option<Arc<dyn PaymentSigner>>,
        token_decimals: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            client,
            ledger,
            signer,
            token_decimals,
        }
    }

    /// Run one paid-request flow, bounded by the overall flow timeout.
    pub async fn execute(&self, request: &PaidRequest) -> Result<PaidResponse, BridgeError> {
        tokio::time::timeout(Duration::from_secs(FLOW_TIMEOUT_SECS), self.run(request))
            .await
            .map_err(|_| BridgeError::Timeout(FLOW_TIMEOUT_SECS))?
    }

    async fn run(&self, request: &PaidRequest) -> Result<PaidResponse, BridgeError> {
        // Probing: issue the call unmodified. Anything but 402 is terminal.
        let (status, headers, body) = self.issue(request, None).await?;
        if status != StatusCode::PAYMENT_REQUIRED {
            debug!("{} {} -> {} (no payment)", request.method, request.url, status);
            return Ok(PaidResponse {
                status: status.as_u16(),
                body,
                payment_made: false,
                payment_amount: None,
            });
        }

        // Challenged.
        let challenge = parse_challenge(&headers)?;
        let amount = challenge.amount as f64 / 10f64.powi(self.token_decimals as i32);

        // Verifying budget. The session lock is held from here until the
        // receipt is persisted so concurrent flows cannot race past a limit.
        let guard = self.ledger.begin_payment().await;
        self.ledger
            .check_spending_limits(amount, request.task_id.as_deref())
            .await?;

        // Signing.
        let signer = self.signer.clone().ok_or(BridgeError::NoSigner)?;
        let signature = signer
            .sign_challenge(&challenge)
            .await
            .map_err(|e| BridgeError::SigningFailed(e.to_string()))?;

        // Paying: the one signed retry this flow will ever make. A second
        // 402 here is passed through, not honored.
        let (paid_status, _, paid_body) = self.issue(request, Some(&signature)).await?;

        // Done: record the receipt, then release the session lock.
        self.ledger
            .record_payment(PaymentReceipt {
                timestamp: Utc::now(),
                endpoint: request.url.clone(),
                method: request.method.clone(),
                amount,
                recipient: challenge.recipient.clone(),
                nonce: challenge.nonce.clone(),
                signature,
                task_id: request.task_id.clone(),
            })
            .await;
        drop(guard);

        info!(
            "paid {:.6} for {} {} -> {}",
            amount, request.method, request.url, paid_status
        );
        Ok(PaidResponse {
            status: paid_status.as_u16(),
            body: paid_body,
            payment_made: true,
            payment_amount: Some(format_amount(amount, self.token_decimals)),
        })
    }

    async fn issue(
        &self,
        request: &PaidRequest,
        signature: Option<&str>,
    ) -> Result<(StatusCode, HeaderMap, Value), BridgeError> {
        let method = parse_method(&request.method)?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(ref headers) = request.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }
        if let Some(sig) = signature {
            builder = builder.header(PAYMENT_HEADER, sig);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, headers, body))
    }
}

fn parse_method(method: &str) -> Result<Method, BridgeError> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        other => Err(BridgeError::Network(format!("unsupported method '{other}'"))),
    }
}

/// Parse and validate the challenge header of a 402 response. A missing
/// or malformed header is fatal and non-recoverable.
fn parse_challenge(headers: &HeaderMap) -> Result<X402Challenge, BridgeError> {
    let raw = headers.get(PAYMENT_REQUIRED_HEADER).ok_or_else(|| {
        BridgeError::InvalidChallenge(format!("missing {PAYMENT_REQUIRED_HEADER} header"))
    })?;
    let text = raw
        .to_str()
        .map_err(|e| BridgeError::InvalidChallenge(e.to_string()))?;
    let challenge: X402Challenge =
        serde_json::from_str(text).map_err(|e| BridgeError::InvalidChallenge(e.to_string()))?;
    if challenge.expires_at <= Utc::now().timestamp() {
        return Err(BridgeError::InvalidChallenge("challenge expired".to_string()));
    }
    Ok(challenge)
}

fn format_amount(amount: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn challenge_header(json: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PAYMENT_REQUIRED_HEADER, HeaderValue::from_str(json).unwrap());
        headers
    }

    #[test]
    fn test_parse_challenge() {
        let headers = challenge_header(
            r#"{"amount":50000,"recipient":"0xr","token":"0xt","nonce":"n","expiresAt":4102444800}"#,
        );
        let challenge = parse_challenge(&headers).unwrap();
        assert_eq!(challenge.amount, 50_000);
        assert_eq!(challenge.recipient, "0xr");
        assert!(challenge.session_id.is_none());
    }

    #[test]
    fn test_parse_challenge_string_amount() {
        let headers = challenge_header(
            r#"{"amount":"75000","recipient":"0xr","token":"0xt","nonce":"n","expiresAt":4102444800}"#,
        );
        assert_eq!(parse_challenge(&headers).unwrap().amount, 75_000);
    }

    #[test]
    fn test_missing_challenge_header_is_invalid() {
        let err = parse_challenge(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidChallenge(_)));
        assert!(!err.recoverable());
    }

    #[test]
    fn test_malformed_challenge_is_invalid() {
        let headers = challenge_header(r#"{"amount":"not a number"}"#);
        assert!(matches!(
            parse_challenge(&headers).unwrap_err(),
            BridgeError::InvalidChallenge(_)
        ));
    }

    #[test]
    fn test_expired_challenge_rejected() {
        let headers = challenge_header(
            r#"{"amount":1,"recipient":"0xr","token":"0xt","nonce":"n","expiresAt":1000000000}"#,
        );
        let err = parse_challenge(&headers).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("POST").unwrap(), Method::POST);
        assert!(parse_method("TRACE").is_err());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(0.05, 6), "0.050000");
        assert_eq!(format_amount(1.0, 2), "1.00");
    }
}

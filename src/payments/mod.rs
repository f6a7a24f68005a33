//! Metered Payment Subsystem
//!
//! Mediates every outbound paid HTTP call a skill makes: multi-scope
//! spending limits, challenge-response payment signing, and a persisted,
//! auditable ledger. Skills never hold payment-signing authority or
//! unrestricted network access themselves.

pub mod balance;
pub mod ledger;
pub mod signer;
pub mod x402;

use crate::ipc::{codes, BridgeErrorResponse};
use thiserror::Error;

/// Payment bridge / ledger error taxonomy. Recoverable errors may be
/// retried by the caller as a whole new flow; the rest are final.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("insufficient funds: need {needed:.6} but balance is {available:.6}")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("{0}")]
    BudgetExceeded(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("payment flow timed out after {0}s")]
    Timeout(u64),

    #[error("invalid payment challenge: {0}")]
    InvalidChallenge(String),

    #[error("no signing capability configured")]
    NoSigner,
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => codes::INSUFFICIENT_FUNDS,
            Self::BudgetExceeded(_) => codes::BUDGET_EXCEEDED,
            Self::SigningFailed(_) => codes::SIGNING_FAILED,
            Self::Network(_) => codes::NETWORK_ERROR,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::InvalidChallenge(_) => codes::INVALID_CHALLENGE,
            Self::NoSigner => codes::NO_SIGNER,
        }
    }

    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    pub fn suggested_action(&self) -> Option<&'static str> {
        match self {
            Self::InsufficientFunds { .. } => Some("top up the agent wallet"),
            Self::BudgetExceeded(_) => Some("raise the spending limits or reset the session"),
            Self::Network(_) | Self::Timeout(_) => Some("retry the request"),
            Self::NoSigner => Some("configure a signing key for the agent"),
            _ => None,
        }
    }

    /// Shape the error for the IPC boundary, echoing the originating
    /// request id when known.
    pub fn to_response(&self, id: Option<u64>) -> BridgeErrorResponse {
        BridgeErrorResponse {
            id,
            error: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            suggested_action: self.suggested_action().map(str::to_string),
        }
    }
}

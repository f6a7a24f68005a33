//! Payment Signing Capability
//!
//! Abstract capability producing a structured signature over a payment
//! challenge on behalf of the agent identity. The bridge only consumes the
//! capability; how keys are provisioned is outside this crate.

use super::x402::X402Challenge;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain tag mixed into every signed payload so a payment signature can
/// never double as any other kind of message.
pub const SIGNING_DOMAIN: &str = "skillbridge-x402-payment-v1";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("bad signing key: {0}")]
    BadKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[async_trait]
pub trait PaymentSigner: Send + Sync {
    /// Payer address the signatures commit to.
    fn address(&self) -> &str;

    /// Produce a signature over the domain-separated challenge fields.
    async fn sign_challenge(&self, challenge: &X402Challenge) -> Result<String, SignerError>;
}

/// Canonical byte encoding of a challenge: domain tag, payer, then every
/// challenge field in declaration order, newline separated.
pub fn challenge_message(payer: &str, challenge: &X402Challenge) -> String {
    format!(
        "{SIGNING_DOMAIN}\n{payer}\n{}\n{}\n{}\n{}\n{}",
        challenge.amount,
        challenge.recipient,
        challenge.token,
        challenge.nonce,
        challenge.expires_at,
    )
}

/// Keyed HMAC-SHA256 signer for local development and tests.
pub struct HmacSigner {
    key: Vec<u8>,
    address: String,
}

impl HmacSigner {
    pub fn new(key: Vec<u8>, address: String) -> Self {
        Self { key, address }
    }

    /// Build from a hex-encoded key, e.g. straight from configuration.
    pub fn from_hex_key(key_hex: &str, address: String) -> Result<Self, SignerError> {
        let key = hex::decode(key_hex.trim().trim_start_matches("0x"))
            .map_err(|e| SignerError::BadKey(e.to_string()))?;
        if key.is_empty() {
            return Err(SignerError::BadKey("empty key".to_string()));
        }
        Ok(Self::new(key, address))
    }
}

#[async_trait]
impl PaymentSigner for HmacSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign_challenge(&self, challenge: &X402Challenge) -> Result<String, SignerError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        mac.update(challenge_message(&self.address, challenge).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(nonce: &str) -> X402Challenge {
        X402Challenge {
            amount: 50_000,
            recipient: "0xrecipient".to_string(),
            token: "0xtoken".to_string(),
            nonce: nonce.to_string(),
            expires_at: 4_102_444_800,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_signature_is_deterministic() {
        let signer = HmacSigner::from_hex_key("a1b2c3d4", "0xpayer".to_string()).unwrap();
        let one = signer.sign_challenge(&challenge("n-1")).await.unwrap();
        let two = signer.sign_challenge(&challenge("n-1")).await.unwrap();
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_signature_binds_nonce() {
        let signer = HmacSigner::from_hex_key("a1b2c3d4", "0xpayer".to_string()).unwrap();
        let one = signer.sign_challenge(&challenge("n-1")).await.unwrap();
        let two = signer.sign_challenge(&challenge("n-2")).await.unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_message_is_domain_separated() {
        let message = challenge_message("0xpayer", &challenge("n-1"));
        assert!(message.starts_with(SIGNING_DOMAIN));
        assert!(message.contains("n-1"));
    }

    #[test]
    fn test_bad_hex_key_rejected() {
        assert!(HmacSigner::from_hex_key("zzzz", "0xpayer".to_string()).is_err());
        assert!(HmacSigner::from_hex_key("", "0xpayer".to_string()).is_err());
    }
}

//! Configuration management

use crate::payments::ledger::SpendingLimits;
use anyhow::Result;
use std::path::PathBuf;

/// USDC on Base, the default payment token.
const DEFAULT_PAYMENT_TOKEN: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Local skill registry root (wins over the remote registry)
    pub skills_dir: Option<PathBuf>,

    /// Remote git registry with one directory per skill id
    pub registry_url: Option<String>,

    /// Bundle cache and registry checkout live here
    pub cache_dir: PathBuf,

    /// Session spending and receipts live here
    pub state_dir: PathBuf,

    /// JSON-RPC endpoint for the on-chain balance check (optional)
    pub rpc_url: Option<String>,

    /// ERC-20 token payments are denominated in
    pub payment_token: String,

    /// Minor units per currency unit exponent (6 for USDC)
    pub token_decimals: u32,

    /// Agent wallet address (payer; also the balance-check owner)
    pub wallet_address: Option<String>,

    /// Hex signing key for the local payment signer (optional)
    pub signing_key: Option<String>,

    /// Spending ceilings in decimal currency units
    pub limits: SpendingLimits,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let skills_dir = std::env::var("SKILLBRIDGE_SKILLS_DIR")
            .ok()
            .map(PathBuf::from);
        let registry_url = std::env::var("SKILLBRIDGE_REGISTRY_URL").ok();

        let cache_dir = std::env::var("SKILLBRIDGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("skillbridge")
            });

        let state_dir = std::env::var("SKILLBRIDGE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("skillbridge")
            });

        let rpc_url = std::env::var("SKILLBRIDGE_RPC_URL").ok();
        let payment_token = std::env::var("SKILLBRIDGE_PAYMENT_TOKEN")
            .unwrap_or_else(|_| DEFAULT_PAYMENT_TOKEN.to_string());
        let token_decimals = std::env::var("SKILLBRIDGE_TOKEN_DECIMALS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6);

        let wallet_address = std::env::var("SKILLBRIDGE_WALLET_ADDRESS").ok();
        let signing_key = std::env::var("SKILLBRIDGE_SIGNING_KEY").ok();

        let defaults = SpendingLimits::default();
        let limits = SpendingLimits {
            per_request: env_f64("SKILLBRIDGE_MAX_PER_REQUEST", defaults.per_request),
            per_task: env_f64("SKILLBRIDGE_MAX_PER_TASK", defaults.per_task),
            per_session: env_f64("SKILLBRIDGE_MAX_PER_SESSION", defaults.per_session),
        };

        Ok(Self {
            skills_dir,
            registry_url,
            cache_dir,
            state_dir,
            rpc_url,
            payment_token,
            token_decimals,
            wallet_address,
            signing_key,
            limits,
        })
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

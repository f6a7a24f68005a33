//! Skillbridge Agent Runtime
//!
//! Runs small third-party skill bundles inside a constrained execution
//! environment and mediates their metered, pay-per-call network access.
//! Skills never hold payment-signing authority or unrestricted network
//! access themselves.
//!
//! # Architecture
//!
//! ```text
//! Agent ──► SkillLoader ──► SkillRunner ──► step process
//!              │                 │              │ fd 3
//!              │ content hash    └── IPC serve ◄┘
//!              ▼                        │
//!          registry             PaymentBridge ──► paid API (x402)
//!          (git / local)                │
//!                                 BudgetLedger ──► session + receipts
//! ```
//!
//! Control flow: the agent selects a skill, the loader fetches and
//! verifies it, the runner executes its steps one at a time, and every
//! paid request a step makes over the channel passes through the bridge,
//! which consults the ledger, signs the challenge, and settles.

pub mod config;
pub mod ipc;
pub mod payments;
pub mod skills;

pub use config::Config;
pub use ipc::client::IpcClient;
pub use ipc::server::IpcHandler;
pub use ipc::{BridgeErrorResponse, IpcRequest, PaidResponseMsg};
pub use payments::balance::{BalanceSource, JsonRpcBalanceSource};
pub use payments::ledger::{BudgetLedger, PaymentReceipt, SessionSpending, SpendingLimits};
pub use payments::signer::{HmacSigner, PaymentSigner};
pub use payments::x402::{PaidRequest, PaidResponse, PaymentBridge, X402Challenge};
pub use payments::BridgeError;
pub use skills::{
    ExecutionResult, ExecutionStep, RunnerConfig, SkillBundle, SkillError, SkillLoader,
    SkillManifest, SkillRunner,
};

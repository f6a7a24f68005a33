//! Skillbridge - Entry Point
//!
//! Commands:
//! - run <skill-id>: fetch, verify and execute a skill bundle
//! - spending: show (or reset) the session spending ledger

use anyhow::{Context, Result};
use skillbridge::payments::balance::BalanceSource;
use skillbridge::{
    BudgetLedger, Config, HmacSigner, IpcHandler, JsonRpcBalanceSource, PaymentBridge,
    PaymentSigner, RunnerConfig, SkillLoader, SkillRunner,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Logs go to stderr; skill output owns stdout.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("run") => run_skill(&args[1..]).await,
        Some("spending") => show_spending(args.iter().any(|a| a == "--reset")).await,
        Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_help();
            anyhow::bail!("unknown command '{other}'")
        }
    }
}

fn print_help() {
    println!("Skillbridge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: skillbridge <COMMAND>");
    println!();
    println!("Commands:");
    println!("  run <skill-id> [--input <text>] [--expect-hash <hash>]");
    println!("                     Fetch, verify and execute a skill bundle");
    println!("  spending [--reset] Show (or reset) the session spending ledger");
    println!();
    println!("Environment variables:");
    println!("  SKILLBRIDGE_SKILLS_DIR      Local skill registry root");
    println!("  SKILLBRIDGE_REGISTRY_URL    Remote git skill registry");
    println!("  SKILLBRIDGE_CACHE_DIR       Bundle cache directory");
    println!("  SKILLBRIDGE_STATE_DIR       Session spending state directory");
    println!("  SKILLBRIDGE_RPC_URL         JSON-RPC endpoint for balance checks");
    println!("  SKILLBRIDGE_PAYMENT_TOKEN   ERC-20 payment token address");
    println!("  SKILLBRIDGE_WALLET_ADDRESS  Agent wallet address");
    println!("  SKILLBRIDGE_SIGNING_KEY     Hex key for the local payment signer");
    println!("  SKILLBRIDGE_MAX_PER_REQUEST / _TASK / _SESSION");
    println!("                              Spending limits in currency units");
}

fn build_ledger(config: &Config) -> Arc<BudgetLedger> {
    let balance: Option<Arc<dyn BalanceSource>> = config
        .rpc_url
        .clone()
        .map(|url| Arc::new(JsonRpcBalanceSource::new(url)) as Arc<dyn BalanceSource>);
    Arc::new(BudgetLedger::new(
        config.state_dir.clone(),
        config.limits,
        balance,
        config.payment_token.clone(),
        config.wallet_address.clone(),
        config.token_decimals,
    ))
}

async fn run_skill(args: &[String]) -> Result<()> {
    let mut skill_id: Option<String> = None;
    let mut input = String::new();
    let mut expect_hash: Option<String> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--input" | "-i" => {
                input = iter.next().context("--input needs a value")?.clone();
            }
            "--expect-hash" => {
                expect_hash = Some(iter.next().context("--expect-hash needs a value")?.clone());
            }
            other if skill_id.is_none() => skill_id = Some(other.to_string()),
            other => anyhow::bail!("unexpected argument '{other}'"),
        }
    }
    let skill_id = skill_id
        .context("usage: skillbridge run <skill-id> [--input <text>] [--expect-hash <hash>]")?;

    let config = Config::from_env()?;
    let loader = SkillLoader::new(
        config.cache_dir.clone(),
        config.skills_dir.clone(),
        config.registry_url.clone(),
    );
    let ledger = build_ledger(&config);

    let signer: Option<Arc<dyn PaymentSigner>> = match (&config.signing_key, &config.wallet_address)
    {
        (Some(key), Some(address)) => {
            Some(Arc::new(HmacSigner::from_hex_key(key, address.clone())?))
        }
        (Some(_), None) => {
            warn!("SKILLBRIDGE_SIGNING_KEY set without SKILLBRIDGE_WALLET_ADDRESS, paid requests disabled");
            None
        }
        _ => None,
    };

    let bridge = Arc::new(PaymentBridge::new(
        ledger.clone(),
        signer,
        config.token_decimals,
    ));
    let handler = Arc::new(IpcHandler::new(bridge, ledger));
    let runner = SkillRunner::new(RunnerConfig::default(), Some(handler));

    let bundle = loader
        .load_verified(&skill_id, expect_hash.as_deref())
        .await?;
    info!(
        "running skill '{}' ({}…)",
        bundle.id,
        &bundle.content_hash[..12]
    );

    let result = runner.execute(&bundle, &input).await?;
    for (index, step) in result.steps.iter().enumerate() {
        info!("step {}: exit {} ({})", index + 1, step.exit_code, step.command);
    }
    println!("{}", result.output);
    Ok(())
}

async fn show_spending(reset: bool) -> Result<()> {
    let config = Config::from_env()?;
    let ledger = build_ledger(&config);
    let session = if reset {
        ledger.reset_session().await
    } else {
        ledger.session_snapshot().await
    };
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

//! One-shot reconciliation: run a single batch (or repair a single market)
//! and print the result as JSON.
//!
//! Usage:
//!   cargo run --bin sync-once                         # full batch
//!   cargo run --bin sync-once -- --dry-run            # show planned writes only
//!   cargo run --bin sync-once -- --repair <address>   # repair one market

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use market_sync::cache::connect_store;
use market_sync::config::Config;
use market_sync::onchain::{ChainScanner, Pubkey, RpcChainClient};
use market_sync::repair::DriftRepairService;
use market_sync::sync::{CacheSyncClient, FixedDelay, ReconciliationContext, RunControl, SyncPipeline};

enum Mode {
    Batch,
    DryRun,
    Repair(Pubkey),
}

fn parse_args(args: &[String]) -> Result<Mode> {
    if args.iter().any(|a| a == "--dry-run") {
        return Ok(Mode::DryRun);
    }
    if let Some(pos) = args.iter().position(|a| a == "--repair") {
        let Some(raw) = args.get(pos + 1) else {
            bail!("--repair needs a market address");
        };
        let address = raw
            .parse::<Pubkey>()
            .with_context(|| format!("invalid market address {raw:?}"))?;
        return Ok(Mode::Repair(address));
    }
    Ok(Mode::Batch)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let mode = parse_args(&args)?;

    let config = match Config::load(Path::new("market-sync.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env()?,
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let program_id = config.rpc.program_id()?;
    let rpc = RpcChainClient::new(
        config.rpc.rpc_url().to_string(),
        config.rpc.commitment.clone(),
        config.rpc.request_timeout(),
    )?;
    let scanner = ChainScanner::new(Arc::new(rpc), program_id);
    let store = connect_store(&config.cache).await?;
    let ctx = ReconciliationContext::new(scanner, CacheSyncClient::new(store));
    let pacer = Arc::new(FixedDelay::from_millis(config.sync.pace_ms));

    let output = match mode {
        Mode::Batch => {
            let pipeline = SyncPipeline::new(ctx, pacer);
            let summary = pipeline.run_batch(&RunControl::new()).await?;
            serde_json::to_string_pretty(&summary)?
        }
        Mode::DryRun => {
            let pipeline = SyncPipeline::new(ctx, pacer);
            let planned = pipeline.plan().await?;
            info!(markets = planned.len(), "dry run complete, nothing written");
            serde_json::to_string_pretty(&planned)?
        }
        Mode::Repair(address) => {
            let repair = DriftRepairService::new(ctx, pacer);
            let report = repair.repair_one(&address).await?;
            serde_json::to_string_pretty(&report)?
        }
    };
    println!("{output}");
    Ok(())
}

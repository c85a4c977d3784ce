use market_sync::api::{self, ApiState};
use market_sync::cache::connect_store;
use market_sync::config::Config;
use market_sync::live::LiveMarketReader;
use market_sync::onchain::{ChainScanner, RpcChainClient};
use market_sync::repair::DriftRepairService;
use market_sync::sync::{CacheSyncClient, FixedDelay, ReconciliationContext, RunControl, SyncPipeline};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONFIG_PATH: &str = "market-sync.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("market-sync v{} starting", env!("CARGO_PKG_VERSION"));

    // --- Chain ---
    let program_id = config.rpc.program_id()?;
    let rpc = RpcChainClient::new(
        config.rpc.rpc_url().to_string(),
        config.rpc.commitment.clone(),
        config.rpc.request_timeout(),
    )?;
    info!(
        network = ?config.rpc.network,
        rpc = %config.rpc.rpc_url(),
        program = %program_id,
        "chain client ready"
    );
    let scanner = ChainScanner::new(Arc::new(rpc), program_id);

    // --- Cache ---
    let store = connect_store(&config.cache).await?;
    let ctx = ReconciliationContext::new(scanner, CacheSyncClient::new(store));

    // --- Services ---
    let pacer = Arc::new(FixedDelay::from_millis(config.sync.pace_ms));
    let pipeline = Arc::new(SyncPipeline::new(ctx.clone(), pacer.clone()));
    let repair = Arc::new(DriftRepairService::new(ctx.clone(), pacer));
    let live = LiveMarketReader::new(ctx, config.sync.live_ttl(), config.rpc.token_decimals());
    let control = RunControl::new();
    let state = ApiState::new(pipeline, repair, live, control.clone());

    // --- Schedules ---
    let mut tasks = Vec::new();
    if config.sync.sweep_interval_secs > 0 {
        tasks.push(api::spawn_batch_schedule(
            state.clone(),
            Duration::from_secs(config.sync.sweep_interval_secs),
        ));
    }
    if config.sync.resolution_sweep_interval_secs > 0 {
        tasks.push(api::spawn_resolution_schedule(
            state.clone(),
            Duration::from_secs(config.sync.resolution_sweep_interval_secs),
        ));
    }

    // --- HTTP ---
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down...");
        control.cancel();
    };
    api::serve(state, &config.server.bind, shutdown).await?;

    // Let in-flight runs finish the market they are on.
    for task in tasks {
        task.await?;
    }
    info!("stopped");
    Ok(())
}

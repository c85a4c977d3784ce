//! HTTP surface of the sync service.
//!
//! Provides:
//!   POST /markets/sync-volumes                 → upsert client-reported volumes
//!   POST /markets/force-sync                   → full batch reconciliation
//!   GET  /markets/resolution-status/:address   → cached vs on-chain resolution
//!   POST /markets/sync-resolution/:address     → repair one market
//!   POST /markets/sync-all-resolutions         → repair every Active row
//!   GET  /markets/:address/cache               → cached row
//!   GET  /markets/live/:address                → live chain view (memoized)
//!   POST /markets/refresh-live/:address        → fresh chain view + cache reconcile
//!   GET  /markets/cache-stats                  → live memo statistics
//!   GET  /health                               → liveness + last run
//!
//! The scheduled batch and resolution sweeps also live here since they share
//! the run gate with `force-sync`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::SyncError;
use crate::live::LiveMarketReader;
use crate::onchain::rpc::ScanError;
use crate::onchain::types::Pubkey;
use crate::repair::{DriftRepairService, RepairError};
use crate::sync::{
    ApplyOutcome, BatchSummary, CacheSyncClient, MarketSyncError, RunControl, SyncPipeline,
    VolumeReport,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub summary: BatchSummary,
}

/// Shared state for the routes and the background sweeps.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<SyncPipeline>,
    pub repair: Arc<DriftRepairService>,
    pub live: LiveMarketReader,
    pub cache: CacheSyncClient,
    pub control: RunControl,
    run_gate: Arc<Mutex<()>>,
    last_run: Arc<Mutex<Option<LastRun>>>,
}

impl ApiState {
    pub fn new(
        pipeline: Arc<SyncPipeline>,
        repair: Arc<DriftRepairService>,
        live: LiveMarketReader,
        control: RunControl,
    ) -> Self {
        let cache = pipeline.context().cache.clone();
        Self {
            pipeline,
            repair,
            live,
            cache,
            control,
            run_gate: Arc::new(Mutex::new(())),
            last_run: Arc::new(Mutex::new(None)),
        }
    }

    /// Run a batch unless one is already in flight. `None` means busy.
    pub async fn try_run_batch(&self) -> Option<Result<BatchSummary, ScanError>> {
        let _gate = self.run_gate.try_lock().ok()?;
        let result = self.pipeline.run_batch(&self.control).await;
        if let Ok(ref summary) = result {
            *self.last_run.lock().await = Some(LastRun {
                finished_at: Utc::now(),
                summary: summary.clone(),
            });
        }
        Some(result)
    }

    pub async fn last_run(&self) -> Option<LastRun> {
        self.last_run.lock().await.clone()
    }
}

/// Run a batch every `every` until `state.control` is cancelled. The first
/// run starts immediately. A run in progress finishes its current market
/// before the task exits.
pub fn spawn_batch_schedule(state: ApiState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                biased;
                _ = state.control.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match state.try_run_batch().await {
                None => warn!("scheduled sync skipped, a run is already in progress"),
                Some(Err(e)) => error!(error = %e, "scheduled sync failed"),
                Some(Ok(_)) => {}
            }
        }
        debug!("batch schedule stopped");
    })
}

/// Sweep cached Active markets every `every` until cancelled. The first
/// sweep waits one full interval.
pub fn spawn_resolution_schedule(state: ApiState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        loop {
            tokio::select! {
                biased;
                _ = state.control.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = state.repair.sweep_resolutions(&state.control).await {
                error!(error = %e, "resolution sweep failed");
            }
        }
        debug!("resolution schedule stopped");
    })
}

/// Build the Axum router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/markets/sync-volumes", post(api_sync_volumes))
        .route("/markets/force-sync", post(api_force_sync))
        .route("/markets/resolution-status/:address", get(api_resolution_status))
        .route("/markets/sync-resolution/:address", post(api_sync_resolution))
        .route("/markets/sync-all-resolutions", post(api_sync_all_resolutions))
        .route("/markets/:address/cache", get(api_cached_row))
        .route("/markets/live/:address", get(api_live_market))
        .route("/markets/refresh-live/:address", post(api_refresh_live))
        .route("/markets/cache-stats", get(api_cache_stats))
        .with_state(state)
}

/// Start the HTTP server. Returns once `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    bind_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn failure(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "success": false, "error": message.to_string() }))).into_response()
}

fn parse_address(raw: &str) -> Result<Pubkey, Response> {
    raw.parse::<Pubkey>()
        .map_err(|e| failure(StatusCode::BAD_REQUEST, format!("invalid market address: {e}")))
}

fn repair_failure(address: &Pubkey, e: RepairError) -> Response {
    if e.is_not_found() {
        return failure(StatusCode::NOT_FOUND, e);
    }
    error!(market = %address, error = %e, "repair request failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn live_failure(address: &Pubkey, e: MarketSyncError) -> Response {
    if e.is_not_found() {
        return failure(StatusCode::NOT_FOUND, e);
    }
    error!(market = %address, stage = e.stage(), error = %e, "live read failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, e)
}

// --- API Handlers ---

async fn api_health(State(state): State<ApiState>) -> Response {
    let last_run = state.last_run().await;
    Json(json!({ "status": "ok", "lastRun": last_run })).into_response()
}

async fn api_sync_volumes(
    State(state): State<ApiState>,
    Json(report): Json<VolumeReport>,
) -> Response {
    match state.cache.apply_volumes(&report).await {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(e @ SyncError::Rejected(_)) => failure(StatusCode::BAD_REQUEST, e),
        Err(e) => {
            error!(market = %report.market_address, error = %e, "volume sync failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn api_force_sync(State(state): State<ApiState>) -> Response {
    match state.try_run_batch().await {
        None => {
            warn!("force-sync rejected, a run is already in progress");
            failure(StatusCode::CONFLICT, "a sync run is already in progress")
        }
        Some(Ok(summary)) => Json(json!({
            "success": true,
            "total": summary.total,
            "synced": summary.synced,
            "failed": summary.failed,
            "unchanged": summary.unchanged,
            "inconsistent": summary.inconsistent,
        }))
        .into_response(),
        Some(Err(e)) => {
            error!(error = %e, "force-sync failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn api_resolution_status(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.repair.resolution_status(&address).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => repair_failure(&address, e),
    }
}

async fn api_sync_resolution(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.repair.repair_one(&address).await {
        Ok(report) => {
            if report.drift_detected {
                state.live.invalidate(&address);
            }
            Json(json!({
                "success": true,
                "wasResolved": report.was_resolved,
                "winningOption": report.winning_option,
                "status": report.status,
                "message": report.message,
            }))
            .into_response()
        }
        Err(e) => repair_failure(&address, e),
    }
}

async fn api_sync_all_resolutions(State(state): State<ApiState>) -> Response {
    match state.repair.sweep_resolutions(&state.control).await {
        Ok(summary) => {
            let mut body = json!({ "success": true });
            if let (Some(obj), Ok(serde_json::Value::Object(stats))) =
                (body.as_object_mut(), serde_json::to_value(&summary))
            {
                obj.extend(stats);
            }
            Json(body).into_response()
        }
        Err(e) => {
            error!(error = %e, "resolution sweep failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn api_cached_row(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.cache.get(&address).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("no cached row for {address}")),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn api_live_market(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.live.get(&address).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => live_failure(&address, e),
    }
}

async fn api_refresh_live(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state.live.refresh(&address).await {
        Ok((view, outcome)) => Json(json!({
            "success": true,
            "marketAddress": address,
            "liveData": {
                "totalVolume": view.total_volume,
                "participantCount": view.participant_count,
                "optionPools": view.option_pools,
                "lastUpdated": view.last_updated,
            },
            "cacheUpdated": outcome != ApplyOutcome::Unchanged,
        }))
        .into_response(),
        Err(e) => live_failure(&address, e),
    }
}

async fn api_cache_stats(State(state): State<ApiState>) -> Response {
    Json(json!({ "success": true, "cacheStatistics": state.live.stats() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRow, CacheStore, MemoryCacheStore};
    use crate::onchain::scanner::ChainScanner;
    use crate::onchain::types::{Market, MarketStatus};
    use crate::sync::{NoPacing, ReconciliationContext};
    use crate::testutil::{key, sample_market, sample_position, FakeChain, PROGRAM};
    use serde_json::Value;

    fn state(chain: Arc<FakeChain>, store: &MemoryCacheStore) -> ApiState {
        let ctx = ReconciliationContext::new(
            ChainScanner::new(chain, PROGRAM),
            CacheSyncClient::new(Arc::new(store.clone())),
        );
        let pipeline = Arc::new(SyncPipeline::new(ctx.clone(), Arc::new(NoPacing)));
        let repair = Arc::new(DriftRepairService::new(ctx.clone(), Arc::new(NoPacing)));
        let live = LiveMarketReader::new(ctx, Duration::from_secs(30), 6);
        ApiState::new(pipeline, repair, live, RunControl::new())
    }

    fn put(chain: &FakeChain, market: &Market) {
        chain.put_market(market);
        chain.put_position(&sample_position(market.address, key(100), 0, 10));
    }

    async fn body(resp: Response) -> (StatusCode, Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_force_sync_reports_counts() {
        let chain = FakeChain::new();
        put(&chain, &sample_market(1));
        put(&chain, &sample_market(2));
        let store = MemoryCacheStore::new();
        let st = state(chain, &store);

        let (status, json) = body(api_force_sync(State(st.clone())).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["total"], 2);
        assert_eq!(json["synced"], 2);
        assert_eq!(json["failed"], 0);

        let (_, health) = body(api_health(State(st)).await).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["lastRun"]["summary"]["synced"], 2);
    }

    #[tokio::test]
    async fn test_force_sync_conflict_while_running() {
        let chain = FakeChain::new();
        let store = MemoryCacheStore::new();
        let st = state(chain, &store);

        let _held = st.run_gate.lock().await;
        let (status, json) = body(api_force_sync(State(st.clone())).await).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_force_sync_scan_failure() {
        let chain = FakeChain::new();
        chain.fail_program_scans(true);
        let store = MemoryCacheStore::new();
        let (status, json) = body(api_force_sync(State(state(chain, &store))).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("node is behind"));
    }

    #[tokio::test]
    async fn test_sync_resolution_route() {
        let chain = FakeChain::new();
        let mut market = sample_market(1);
        market.status = MarketStatus::Resolved;
        market.winning_option = Some(0);
        put(&chain, &market);
        let store = MemoryCacheStore::new();
        store
            .upsert(&CacheRow {
                market_address: key(1),
                total_volume: 100,
                option_pools: vec![60, 40],
                participant_count: 1,
                status: MarketStatus::Active,
                winning_option: None,
                last_synced_at: Utc::now(),
            })
            .await
            .unwrap();
        let st = state(chain, &store);

        let (_, before) = body(
            api_resolution_status(State(st.clone()), Path(key(1).to_string())).await,
        )
        .await;
        assert_eq!(before["needsSync"], true);
        assert_eq!(before["cachedStatus"], "Active");
        assert_eq!(before["chainStatus"], "Resolved");

        let (status, json) =
            body(api_sync_resolution(State(st.clone()), Path(key(1).to_string())).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["wasResolved"], true);
        assert_eq!(json["winningOption"], 0);

        let (_, after) =
            body(api_resolution_status(State(st), Path(key(1).to_string())).await).await;
        assert_eq!(after["needsSync"], false);
    }

    #[tokio::test]
    async fn test_bad_and_unknown_addresses() {
        let chain = FakeChain::new();
        let store = MemoryCacheStore::new();
        let st = state(chain, &store);

        let (status, _) =
            body(api_sync_resolution(State(st.clone()), Path("not-a-key".to_string())).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            body(api_sync_resolution(State(st.clone()), Path(key(5).to_string())).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = body(api_cached_row(State(st), Path(key(5).to_string())).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_volumes_route() {
        let chain = FakeChain::new();
        let store = MemoryCacheStore::new();
        let st = state(chain, &store);
        let report: VolumeReport = serde_json::from_value(json!({
            "marketAddress": key(3).to_string(),
            "optionPools": [5, 7],
            "participantCount": 2,
        }))
        .unwrap();

        let (status, json) = body(api_sync_volumes(State(st.clone()), Json(report)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let (_, row) = body(api_cached_row(State(st), Path(key(3).to_string())).await).await;
        assert_eq!(row["totalVolume"], 12);
        assert_eq!(row["status"], "Active");
    }

    #[tokio::test]
    async fn test_sync_all_resolutions_route() {
        let chain = FakeChain::new();
        let mut market = sample_market(1);
        market.status = MarketStatus::Resolved;
        market.winning_option = Some(1);
        put(&chain, &market);
        let store = MemoryCacheStore::new();
        let st = state(chain, &store);
        body(api_force_sync(State(st.clone())).await).await;

        // Resolved rows are not revisited.
        let (_, json) = body(api_sync_all_resolutions(State(st)).await).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["totalMarkets"], 0);
        assert_eq!(json["newlyResolved"], 0);
    }

    #[tokio::test]
    async fn test_live_routes() {
        let chain = FakeChain::new();
        put(&chain, &sample_market(1));
        let store = MemoryCacheStore::new();
        let st = state(chain.clone(), &store);

        let (status, view) =
            body(api_live_market(State(st.clone()), Path(key(1).to_string())).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["marketAddress"], key(1).to_string());
        assert_eq!(view["participantCount"], 1);
        assert_eq!(view["status"], "Active");
        assert_eq!(view["dataSource"], "live_blockchain");
        assert!(store.is_empty());

        body(api_live_market(State(st.clone()), Path(key(1).to_string())).await).await;
        assert_eq!(chain.account_reads(), 1);

        let (_, stats) = body(api_cache_stats(State(st.clone())).await).await;
        assert_eq!(stats["cacheStatistics"]["totalEntries"], 1);
        assert_eq!(stats["cacheStatistics"]["cacheExpiryMs"], 30_000);

        let (status, refreshed) =
            body(api_refresh_live(State(st.clone()), Path(key(1).to_string())).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed["cacheUpdated"], true);
        assert_eq!(refreshed["liveData"]["participantCount"], 1);
        assert_eq!(chain.account_reads(), 2);
        assert!(store.get(&key(1)).await.unwrap().is_some());

        let (status, _) =
            body(api_live_market(State(st), Path(key(8).to_string())).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_stop_on_cancel() {
        let chain = FakeChain::new();
        put(&chain, &sample_market(1));
        let store = MemoryCacheStore::new();
        let st = state(chain.clone(), &store);

        let batch = spawn_batch_schedule(st.clone(), Duration::from_secs(300));
        let sweep = spawn_resolution_schedule(st.clone(), Duration::from_secs(60));
        // Past the immediate first batch, short of either next tick.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(st.last_run().await.is_some());
        assert_eq!(chain.program_scans(), 2);

        st.control.cancel();
        batch.await.unwrap();
        sweep.await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(chain.program_scans(), 2);
    }
}

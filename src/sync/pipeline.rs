use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ApplyOutcome, MarketSyncError, Pacer, ReconciliationContext, RunControl};
use crate::onchain::codec::decode_market;
use crate::onchain::rpc::ScanError;
use crate::onchain::types::Pubkey;
use crate::reconcile::{classify, reconcile, Drift, SyncOperation};

/// One market that did not make it into the cache this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFailure {
    pub market_address: Pubkey,
    pub stage: &'static str,
    pub error: String,
}

/// Result of a full batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Market accounts returned by the scan.
    pub total: usize,
    /// Markets whose cache row now matches chain, including no-ops.
    pub synced: usize,
    pub failed: usize,
    /// Synced markets that needed no write.
    pub unchanged: usize,
    /// Failed markets whose on-chain resolution was inconsistent.
    pub inconsistent: usize,
    pub failures: Vec<MarketFailure>,
    /// Set when the run was cancelled before visiting every market.
    pub aborted: bool,
}

/// Dry-run result for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSync {
    pub market_address: Pubkey,
    pub drift: Option<Drift>,
    pub operation: Option<SyncOperation>,
    pub error: Option<String>,
}

pub struct SyncPipeline {
    ctx: ReconciliationContext,
    pacer: Arc<dyn Pacer>,
}

impl SyncPipeline {
    pub fn new(ctx: ReconciliationContext, pacer: Arc<dyn Pacer>) -> Self {
        Self { ctx, pacer }
    }

    pub fn context(&self) -> &ReconciliationContext {
        &self.ctx
    }

    /// Reconcile every market account of the program into the cache.
    ///
    /// Only a failed market scan fails the run. Everything after that is
    /// per-market and lands in the summary.
    pub async fn run_batch(&self, control: &RunControl) -> Result<BatchSummary, ScanError> {
        let accounts: Vec<_> = self.ctx.scanner.scan_markets().await?.collect();
        let mut summary = BatchSummary {
            total: accounts.len(),
            ..Default::default()
        };
        info!(total = summary.total, program = %self.ctx.scanner.program_id(), "sync run started");

        for (i, raw) in accounts.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = self.pacer.pause() => {}
                    _ = control.cancelled() => {}
                }
            }
            if control.is_cancelled() {
                warn!(visited = i, total = summary.total, "sync run cancelled");
                summary.aborted = true;
                break;
            }

            let _guard = self.ctx.locks.lock(&raw.address).await;
            let result = match decode_market(raw.address, &raw.data) {
                Ok(market) => self.ctx.sync_market(market).await,
                Err(e) => Err(MarketSyncError::from(e)),
            };

            match result {
                Ok((_, outcome)) => {
                    summary.synced += 1;
                    if outcome == ApplyOutcome::Unchanged {
                        summary.unchanged += 1;
                    }
                }
                Err(e) => {
                    warn!(market = %raw.address, stage = e.stage(), error = %e, "market sync failed");
                    summary.failed += 1;
                    if e.is_inconsistent() {
                        summary.inconsistent += 1;
                    }
                    summary.failures.push(MarketFailure {
                        market_address: raw.address,
                        stage: e.stage(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            total = summary.total,
            synced = summary.synced,
            failed = summary.failed,
            unchanged = summary.unchanged,
            inconsistent = summary.inconsistent,
            "sync run finished"
        );
        let locks = self.ctx.locks.prune();
        debug!(locks, "market locks pruned");
        Ok(summary)
    }

    /// Compute what a run would write, without writing.
    pub async fn plan(&self) -> Result<Vec<PlannedSync>, ScanError> {
        let mut planned = Vec::new();
        for (i, raw) in self.ctx.scanner.scan_markets().await?.enumerate() {
            if i > 0 {
                self.pacer.pause().await;
            }
            planned.push(self.plan_one(raw.address, &raw.data).await);
        }
        Ok(planned)
    }

    async fn plan_one(&self, address: Pubkey, data: &[u8]) -> PlannedSync {
        let attempt = async {
            let market = decode_market(address, data)?;
            let snapshot = self.ctx.snapshot(market).await?;
            let cached = self.ctx.cache.get(&address).await?;
            let drift = classify(&snapshot, cached.as_ref());
            let op = reconcile(&snapshot, cached.as_ref())?;
            Ok::<_, MarketSyncError>((drift, op))
        };
        match attempt.await {
            Ok((drift, op)) => PlannedSync {
                market_address: address,
                drift: Some(drift),
                operation: Some(op),
                error: None,
            },
            Err(e) => PlannedSync {
                market_address: address,
                drift: None,
                operation: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::onchain::codec::encode::encode_market;
    use crate::onchain::scanner::ChainScanner;
    use crate::onchain::types::MarketStatus;
    use crate::sync::{CacheSyncClient, NoPacing};
    use crate::testutil::{key, sample_market, sample_position, FakeChain, PROGRAM};
    use std::sync::Arc;

    fn pipeline(chain: Arc<FakeChain>, store: &MemoryCacheStore) -> SyncPipeline {
        let ctx = ReconciliationContext::new(
            ChainScanner::new(chain, PROGRAM),
            CacheSyncClient::new(Arc::new(store.clone())),
        );
        SyncPipeline::new(ctx, Arc::new(NoPacing))
    }

    fn seed_markets(chain: &FakeChain, seeds: &[u8]) {
        for &seed in seeds {
            let market = sample_market(seed);
            chain.put_market(&market);
            chain.put_position(&sample_position(market.address, key(100), 0, 10));
            chain.put_position(&sample_position(market.address, key(100), 1, 5));
            chain.put_position(&sample_position(market.address, key(101), 0, 3));
        }
    }

    #[tokio::test]
    async fn test_batch_inserts_every_market() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2, 3]);
        let store = MemoryCacheStore::new();

        let summary = pipeline(chain, &store).run_batch(&RunControl::new()).await.unwrap();
        assert_eq!((summary.total, summary.synced, summary.failed), (3, 3, 0));
        assert_eq!(summary.unchanged, 0);
        assert!(!summary.aborted);

        let row = store.get(&key(2)).await.unwrap().unwrap();
        assert_eq!(row.participant_count, 2);
        assert_eq!(row.option_pools, vec![60, 40]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2]);
        let mut truncated = encode_market(&sample_market(3));
        truncated.truncate(400);
        chain.put_unfiltered(key(3), truncated);
        seed_markets(&chain, &[4, 5]);
        let store = MemoryCacheStore::new();

        let summary = pipeline(chain, &store).run_batch(&RunControl::new()).await.unwrap();
        assert_eq!((summary.total, summary.synced, summary.failed), (5, 4, 1));
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].market_address, key(3));
        assert_eq!(summary.failures[0].stage, "decode");
        assert!(store.get(&key(3)).await.unwrap().is_none());
        for n in [1, 2, 4, 5] {
            let row = store.get(&key(n)).await.unwrap().unwrap();
            assert_eq!(row.option_pools, vec![60, 40]);
            assert_eq!(row.total_volume, 100);
            assert_eq!(row.participant_count, 2);
            assert_eq!(row.status, MarketStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2, 3]);
        let store = MemoryCacheStore::new();
        let p = pipeline(chain, &store);

        p.run_batch(&RunControl::new()).await.unwrap();
        let writes = store.write_count();
        let summary = p.run_batch(&RunControl::new()).await.unwrap();
        assert_eq!(store.write_count(), writes);
        assert_eq!((summary.synced, summary.unchanged), (3, 3));
    }

    #[tokio::test]
    async fn test_chain_change_is_picked_up() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1]);
        let store = MemoryCacheStore::new();
        let p = pipeline(chain.clone(), &store);
        p.run_batch(&RunControl::new()).await.unwrap();

        let mut market = sample_market(1);
        market.status = MarketStatus::Resolved;
        market.winning_option = Some(1);
        chain.put_market(&market);
        chain.put_position(&sample_position(market.address, key(102), 1, 7));

        let summary = p.run_batch(&RunControl::new()).await.unwrap();
        assert_eq!(summary.unchanged, 0);
        let row = store.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(row.status, MarketStatus::Resolved);
        assert_eq!(row.winning_option, Some(1));
        assert_eq!(row.participant_count, 3);
    }

    #[tokio::test]
    async fn test_inconsistent_resolution_not_written() {
        let chain = FakeChain::new();
        let mut market = sample_market(1);
        market.status = MarketStatus::Resolved;
        market.winning_option = Some(3);
        chain.put_market(&market);
        let store = MemoryCacheStore::new();

        let summary = pipeline(chain, &store).run_batch(&RunControl::new()).await.unwrap();
        assert_eq!((summary.failed, summary.inconsistent), (1, 1));
        assert_eq!(summary.failures[0].stage, "reconcile");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_halt() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2, 3]);
        let store = MemoryCacheStore::new();
        store.reject_writes_for(key(2));

        let summary = pipeline(chain, &store).run_batch(&RunControl::new()).await.unwrap();
        assert_eq!((summary.synced, summary.failed), (2, 1));
        assert_eq!(summary.failures[0].stage, "apply");
        assert!(store.get(&key(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_early() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2]);
        let store = MemoryCacheStore::new();
        let control = RunControl::new();
        control.cancel();

        let summary = pipeline(chain, &store).run_batch(&control).await.unwrap();
        assert!(summary.aborted);
        assert_eq!((summary.total, summary.synced), (2, 0));
        assert!(store.is_empty());
    }

    /// Cancels the run the first time the batch pauses between markets.
    struct CancelOnPause(RunControl);

    #[async_trait::async_trait]
    impl Pacer for CancelOnPause {
        async fn pause(&self) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancel_between_markets_keeps_finished_work() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2, 3]);
        let store = MemoryCacheStore::new();
        let control = RunControl::new();
        let ctx = ReconciliationContext::new(
            ChainScanner::new(chain, PROGRAM),
            CacheSyncClient::new(Arc::new(store.clone())),
        );
        let p = SyncPipeline::new(ctx, Arc::new(CancelOnPause(control.clone())));

        let summary = p.run_batch(&control).await.unwrap();
        assert!(summary.aborted);
        assert_eq!((summary.total, summary.synced, summary.failed), (3, 1, 0));
        assert_eq!(store.len(), 1);
        assert!(p.context().locks.is_empty());
    }

    #[tokio::test]
    async fn test_batch_prunes_market_locks() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2, 3]);
        let store = MemoryCacheStore::new();
        let p = pipeline(chain, &store);

        p.run_batch(&RunControl::new()).await.unwrap();
        assert!(p.context().locks.is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_fails_run() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1]);
        chain.fail_program_scans(true);
        let store = MemoryCacheStore::new();

        let err = pipeline(chain, &store).run_batch(&RunControl::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::Rpc { .. }));
    }

    #[tokio::test]
    async fn test_plan_does_not_write() {
        let chain = FakeChain::new();
        seed_markets(&chain, &[1, 2]);
        let store = MemoryCacheStore::new();

        let planned = pipeline(chain, &store).plan().await.unwrap();
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|p| p.drift == Some(Drift::Missing)));
        assert!(matches!(planned[0].operation, Some(SyncOperation::Insert(_))));
        assert_eq!(store.write_count(), 0);
    }
}

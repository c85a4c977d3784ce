//! Batch reconciliation of every market account into the cache.
//!
//! Pipeline stages per market: scan → decode → aggregate participants →
//! reconcile → apply. Markets run one at a time in scan order with a pause
//! between them; a failure at any stage is recorded against that market and
//! the batch moves on.

pub mod client;
pub mod pacer;
pub mod pipeline;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::cache::SyncError;
use crate::onchain::codec::{decode_market, DecodeError};
use crate::onchain::rpc::ScanError;
use crate::onchain::scanner::ChainScanner;
use crate::onchain::types::{Market, Pubkey};
use crate::participants::{count_distinct_holders, summarize};
use crate::reconcile::{reconcile, ChainSnapshot, ReconcileError, SyncOperation};

pub use client::{ApplyOutcome, CacheSyncClient, VolumeReport};
pub use pacer::{FixedDelay, NoPacing, Pacer};
pub use pipeline::{BatchSummary, MarketFailure, PlannedSync, SyncPipeline};

/// Why one market could not be brought in sync.
#[derive(Error, Debug)]
pub enum MarketSyncError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("chain read failed: {0}")]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("cache write failed: {0}")]
    Cache(#[from] SyncError),
}

impl MarketSyncError {
    pub fn stage(&self) -> &'static str {
        match self {
            MarketSyncError::Decode(_) => "decode",
            MarketSyncError::Scan(_) => "aggregate",
            MarketSyncError::Reconcile(_) => "reconcile",
            MarketSyncError::Cache(_) => "apply",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MarketSyncError::Scan(ScanError::AccountNotFound(_)))
    }

    pub fn is_inconsistent(&self) -> bool {
        matches!(self, MarketSyncError::Reconcile(ReconcileError::InconsistentResolution { .. }))
    }
}

/// Per-market async locks. Every write path for an address holds its lock
/// from chain read through cache write.
#[derive(Clone, Default)]
pub struct MarketLocks {
    inner: Arc<DashMap<Pubkey, Arc<Mutex<()>>>>,
}

impl MarketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: &Pubkey) -> OwnedMutexGuard<()> {
        let mutex = self
            .inner
            .entry(*address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns how many remain.
    pub fn prune(&self) -> usize {
        self.inner.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Cooperative cancellation, checked between markets. A market already
/// being applied always finishes.
#[derive(Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Everything a sync or repair needs, injected rather than global.
#[derive(Clone)]
pub struct ReconciliationContext {
    pub scanner: ChainScanner,
    pub cache: CacheSyncClient,
    pub locks: MarketLocks,
}

impl ReconciliationContext {
    pub fn new(scanner: ChainScanner, cache: CacheSyncClient) -> Self {
        Self {
            scanner,
            cache,
            locks: MarketLocks::new(),
        }
    }

    /// Read and decode one Market account.
    pub async fn read_market(&self, address: &Pubkey) -> Result<Market, MarketSyncError> {
        let raw = self.scanner.fetch_market(address).await?;
        Ok(decode_market(raw.address, &raw.data)?)
    }

    /// Aggregate participants for a decoded market and stamp the read time.
    pub async fn snapshot(&self, market: Market) -> Result<ChainSnapshot, ScanError> {
        let scan = self.scanner.load_positions(&market.address).await?;
        let participant_count = count_distinct_holders(
            scan.positions.iter().filter(|p| p.market == market.address),
        ) as u64;

        let summary = summarize(&market, &scan.positions);
        if summary.ignored > 0 {
            debug!(
                market = %market.address,
                ignored = summary.ignored,
                "positions outside the market's options"
            );
        }
        if summary.total_staked() != market.total_pool {
            debug!(
                market = %market.address,
                staked = summary.total_staked(),
                total_pool = market.total_pool,
                "position stakes differ from total pool"
            );
        }

        Ok(ChainSnapshot {
            market,
            participant_count,
            observed_at: Utc::now(),
        })
    }

    /// Reconcile one market against its cached row and apply the result.
    /// Callers hold the market's lock.
    pub async fn sync_market(
        &self,
        market: Market,
    ) -> Result<(SyncOperation, ApplyOutcome), MarketSyncError> {
        let snapshot = self.snapshot(market).await?;
        self.apply_snapshot(&snapshot).await
    }

    /// Reconcile an already-taken snapshot. Callers hold the market's lock.
    pub async fn apply_snapshot(
        &self,
        snapshot: &ChainSnapshot,
    ) -> Result<(SyncOperation, ApplyOutcome), MarketSyncError> {
        let cached = self.cache.get(&snapshot.market.address).await?;
        let op = reconcile(snapshot, cached.as_ref())?;
        let outcome = self.cache.apply(&op).await?;
        debug!(market = %snapshot.market.address, outcome = ?outcome, "market reconciled");
        Ok((op, outcome))
    }
}

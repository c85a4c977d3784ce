//! On-demand drift repair for single markets and the periodic sweep over
//! cached markets that still look Active.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheRow, SyncError};
use crate::onchain::codec::DecodeError;
use crate::onchain::rpc::ScanError;
use crate::onchain::types::{Market, MarketStatus, Pubkey};
use crate::reconcile::{check_resolution_drift, ReconcileError};
use crate::sync::{ApplyOutcome, MarketSyncError, Pacer, ReconciliationContext, RunControl};

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("chain read failed: {0}")]
    Scan(#[from] ScanError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("cache access failed: {0}")]
    Cache(#[from] SyncError),
}

impl RepairError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepairError::Scan(ScanError::AccountNotFound(_)))
    }
}

impl From<MarketSyncError> for RepairError {
    fn from(e: MarketSyncError) -> Self {
        match e {
            MarketSyncError::Decode(e) => RepairError::Decode(e),
            MarketSyncError::Scan(e) => RepairError::Scan(e),
            MarketSyncError::Reconcile(e) => RepairError::Reconcile(e),
            MarketSyncError::Cache(e) => RepairError::Cache(e),
        }
    }
}

/// Outcome of repairing one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub market_address: Pubkey,
    pub drift_detected: bool,
    /// Chain reports the market Resolved.
    pub was_resolved: bool,
    pub status: MarketStatus,
    /// Chain winner, present only for a Resolved market.
    pub winning_option: Option<u8>,
    pub outcome: Option<ApplyOutcome>,
    pub message: String,
}

/// Read-only comparison of cached and on-chain resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStatus {
    pub market_address: Pubkey,
    pub needs_sync: bool,
    pub cached_status: Option<MarketStatus>,
    pub chain_status: MarketStatus,
    pub cached_winning_option: Option<u8>,
    pub chain_winning_option: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub total_markets: usize,
    pub newly_resolved: usize,
    pub cancelled: usize,
    pub still_active: usize,
    pub errors: usize,
    /// Set when the sweep was cancelled before visiting every market.
    pub aborted: bool,
}

pub struct DriftRepairService {
    ctx: ReconciliationContext,
    pacer: Arc<dyn Pacer>,
}

impl DriftRepairService {
    pub fn new(ctx: ReconciliationContext, pacer: Arc<dyn Pacer>) -> Self {
        Self { ctx, pacer }
    }

    async fn read_market(&self, address: &Pubkey) -> Result<Market, RepairError> {
        Ok(self.ctx.read_market(address).await?)
    }

    /// Bring one market's cached resolution in line with chain.
    ///
    /// Holds the market's lock for the whole read-compare-write, so
    /// concurrent repairs (and batch runs) of the same market serialize.
    pub async fn repair_one(&self, address: &Pubkey) -> Result<RepairReport, RepairError> {
        let _guard = self.ctx.locks.lock(address).await;

        let market = self.read_market(address).await?;
        let cached = self.ctx.cache.get(address).await?;
        let winning_option =
            market
                .checked_winner()
                .map_err(|_| ReconcileError::InconsistentResolution {
                    market_address: market.address,
                    raw_winner: market.winning_option,
                    option_count: market.option_count,
                    cached_status: cached.as_ref().map(|row| row.status),
                    cached_winner: cached.as_ref().and_then(|row| row.winning_option),
                })?;
        let status = market.status;
        let was_resolved = status == MarketStatus::Resolved;
        let drift = cached
            .as_ref()
            .map_or(true, |row| check_resolution_drift(&market, row));

        if !drift {
            debug!(market = %address, status = %status, "resolution already consistent");
            return Ok(RepairReport {
                market_address: *address,
                drift_detected: false,
                was_resolved,
                status,
                winning_option,
                outcome: None,
                message: "already consistent".to_string(),
            });
        }

        let previous = cached.as_ref().map(|row| row.status);
        let (_, outcome) = self.ctx.sync_market(market).await?;

        info!(
            market = %address,
            from = ?previous,
            to = %status,
            winning_option = ?winning_option,
            "repaired resolution drift"
        );
        Ok(RepairReport {
            market_address: *address,
            drift_detected: true,
            was_resolved,
            status,
            winning_option,
            outcome: Some(outcome),
            message: match previous {
                Some(prev) => format!("status {prev} -> {status}"),
                None => format!("cache row created as {status}"),
            },
        })
    }

    pub async fn resolution_status(&self, address: &Pubkey) -> Result<ResolutionStatus, RepairError> {
        let market = self.read_market(address).await?;
        let cached: Option<CacheRow> = self.ctx.cache.get(address).await?;
        let needs_sync = cached
            .as_ref()
            .map_or(true, |row| check_resolution_drift(&market, row));
        Ok(ResolutionStatus {
            market_address: *address,
            needs_sync,
            cached_status: cached.as_ref().map(|row| row.status),
            chain_status: market.status,
            cached_winning_option: cached.as_ref().and_then(|row| row.winning_option),
            chain_winning_option: market
                .winning_option
                .filter(|_| market.status == MarketStatus::Resolved),
        })
    }

    /// Repair every cached market still marked Active. Stops between
    /// markets once `control` is cancelled.
    pub async fn sweep_resolutions(&self, control: &RunControl) -> Result<SweepSummary, SyncError> {
        let active: Vec<Pubkey> = self
            .ctx
            .cache
            .rows()
            .await?
            .into_iter()
            .filter(|row| row.status == MarketStatus::Active)
            .map(|row| row.market_address)
            .collect();

        let mut summary = SweepSummary {
            total_markets: active.len(),
            ..Default::default()
        };
        for (i, address) in active.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = self.pacer.pause() => {}
                    _ = control.cancelled() => {}
                }
            }
            if control.is_cancelled() {
                warn!(visited = i, total = summary.total_markets, "resolution sweep cancelled");
                summary.aborted = true;
                break;
            }
            match self.repair_one(address).await {
                Ok(report) if report.drift_detected && report.was_resolved => {
                    summary.newly_resolved += 1
                }
                Ok(report) if report.status == MarketStatus::Cancelled => summary.cancelled += 1,
                Ok(_) => summary.still_active += 1,
                Err(e) => {
                    warn!(market = %address, error = %e, "resolution sweep failed for market");
                    summary.errors += 1;
                }
            }
        }
        info!(
            total = summary.total_markets,
            newly_resolved = summary.newly_resolved,
            cancelled = summary.cancelled,
            still_active = summary.still_active,
            errors = summary.errors,
            "resolution sweep finished"
        );
        Ok(summary)
    }
}

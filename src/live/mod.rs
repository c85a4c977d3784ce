//! Live market reads straight from chain, memoized for a short TTL.
//!
//! A read decodes the Market account and counts participants the same way a
//! batch sync does, then converts pools to token units for display. Reads
//! never touch the cache; `refresh` bypasses the memo and also reconciles the
//! cache row under the market's lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::onchain::types::{MarketStatus, Pubkey};
use crate::reconcile::ChainSnapshot;
use crate::sync::{ApplyOutcome, MarketSyncError, ReconciliationContext};

pub const DATA_SOURCE: &str = "live_blockchain";

/// Display view of one market as chain reports it right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMarket {
    pub market_address: Pubkey,
    /// Per-option pools in token units.
    pub option_pools: Vec<f64>,
    pub total_volume: f64,
    pub participant_count: u64,
    pub option_percentages: Vec<f64>,
    pub question: String,
    pub options: Vec<String>,
    pub status: MarketStatus,
    pub winning_option: Option<u8>,
    pub last_updated: DateTime<Utc>,
    pub data_source: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub cache_expiry_ms: u64,
}

/// Base units to token units.
pub fn to_ui_amount(amount: u64, decimals: u32) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

fn live_view(snapshot: &ChainSnapshot, decimals: u32) -> LiveMarket {
    let market = &snapshot.market;
    let option_pools: Vec<f64> = market
        .pools()
        .iter()
        .map(|p| to_ui_amount(*p, decimals))
        .collect();
    let total_volume: f64 = option_pools.iter().sum();
    let option_percentages = option_pools
        .iter()
        .map(|p| if total_volume > 0.0 { p / total_volume * 100.0 } else { 0.0 })
        .collect();
    let winning_option = market.checked_winner().unwrap_or_else(|e| {
        warn!(market = %market.address, error = %e, "live read of inconsistent resolution");
        None
    });

    LiveMarket {
        market_address: market.address,
        option_pools,
        total_volume,
        participant_count: snapshot.participant_count,
        option_percentages,
        question: market.question.clone(),
        options: market
            .labels()
            .iter()
            .filter(|l| !l.is_empty())
            .cloned()
            .collect(),
        status: market.status,
        winning_option,
        last_updated: snapshot.observed_at,
        data_source: DATA_SOURCE,
    }
}

#[derive(Clone)]
pub struct LiveMarketReader {
    ctx: ReconciliationContext,
    memo: Arc<DashMap<Pubkey, (Instant, LiveMarket)>>,
    ttl: Duration,
    token_decimals: u32,
}

impl LiveMarketReader {
    pub fn new(ctx: ReconciliationContext, ttl: Duration, token_decimals: u32) -> Self {
        Self {
            ctx,
            memo: Arc::new(DashMap::new()),
            ttl,
            token_decimals,
        }
    }

    /// Live view of `address`, served from the memo while younger than the TTL.
    pub async fn get(&self, address: &Pubkey) -> Result<LiveMarket, MarketSyncError> {
        if let Some(entry) = self.memo.get(address) {
            let (stored, view) = entry.value();
            if stored.elapsed() < self.ttl {
                debug!(market = %address, "live read served from memo");
                return Ok(view.clone());
            }
        }

        let market = self.ctx.read_market(address).await?;
        let snapshot = self.ctx.snapshot(market).await?;
        let view = live_view(&snapshot, self.token_decimals);
        self.memo.insert(*address, (Instant::now(), view.clone()));
        debug!(
            market = %address,
            total_volume = view.total_volume,
            participants = view.participant_count,
            "live read from chain"
        );
        Ok(view)
    }

    /// Re-read `address` from chain, ignoring the memo, and reconcile its
    /// cache row from the same read.
    pub async fn refresh(
        &self,
        address: &Pubkey,
    ) -> Result<(LiveMarket, ApplyOutcome), MarketSyncError> {
        self.invalidate(address);
        let _guard = self.ctx.locks.lock(address).await;

        let market = self.ctx.read_market(address).await?;
        let snapshot = self.ctx.snapshot(market).await?;
        let view = live_view(&snapshot, self.token_decimals);
        let (_, outcome) = self.ctx.apply_snapshot(&snapshot).await?;
        self.memo.insert(*address, (Instant::now(), view.clone()));
        info!(market = %address, outcome = ?outcome, "live data refreshed");
        Ok((view, outcome))
    }

    pub fn invalidate(&self, address: &Pubkey) {
        self.memo.remove(address);
    }

    pub fn clear(&self) {
        self.memo.clear();
    }

    pub fn stats(&self) -> LiveCacheStats {
        let valid = self
            .memo
            .iter()
            .filter(|entry| entry.value().0.elapsed() < self.ttl)
            .count();
        let total = self.memo.len();
        LiveCacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
            cache_expiry_ms: self.ttl.as_millis() as u64,
        }
    }
}

//! Diffing decoded chain state against cached rows.
//!
//! Chain state always wins. The engine never reads the cache to decide what
//! is correct, only to decide what needs to change. Everything here is pure:
//! no I/O, no clocks (the read time travels with the snapshot).

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheRow;
use crate::onchain::types::{Market, MarketStatus, Pubkey};

/// A market as read from chain, plus the aggregates derived alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub market: Market,
    pub participant_count: u64,
    /// When the chain was read. Becomes `last_synced_at` on write.
    pub observed_at: DateTime<Utc>,
}

/// Fields of a cache row that need to change. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_pools: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MarketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_option: Option<Option<u8>>,
}

impl RowPatch {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.total_volume.is_some() {
            fields.push("total_volume");
        }
        if self.option_pools.is_some() {
            fields.push("option_pools");
        }
        if self.participant_count.is_some() {
            fields.push("participant_count");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.winning_option.is_some() {
            fields.push("winning_option");
        }
        fields
    }

    fn touches_volume(&self) -> bool {
        self.total_volume.is_some() || self.option_pools.is_some() || self.participant_count.is_some()
    }

    fn touches_status(&self) -> bool {
        self.status.is_some() || self.winning_option.is_some()
    }

    /// Apply to `row`, stamping `synced_at`.
    pub fn apply(&self, row: &mut CacheRow, synced_at: DateTime<Utc>) {
        if let Some(v) = self.total_volume {
            row.total_volume = v;
        }
        if let Some(ref pools) = self.option_pools {
            row.option_pools = pools.clone();
        }
        if let Some(c) = self.participant_count {
            row.participant_count = c;
        }
        if let Some(s) = self.status {
            row.status = s;
        }
        if let Some(w) = self.winning_option {
            row.winning_option = w;
        }
        row.last_synced_at = synced_at;
    }
}

/// What the cache needs to match the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOperation {
    Insert(CacheRow),
    Update {
        market_address: Pubkey,
        patch: RowPatch,
        synced_at: DateTime<Utc>,
    },
    NoOp {
        market_address: Pubkey,
    },
}

impl SyncOperation {
    pub fn market_address(&self) -> &Pubkey {
        match self {
            SyncOperation::Insert(row) => &row.market_address,
            SyncOperation::Update { market_address, .. } => market_address,
            SyncOperation::NoOp { market_address } => market_address,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, SyncOperation::NoOp { .. })
    }

    /// The row this operation produces from `current`, or `None` when there
    /// is nothing to write. Deterministic: the same operation over the same
    /// input always yields the same row.
    pub fn target_row(&self, current: Option<&CacheRow>) -> Result<Option<CacheRow>, Pubkey> {
        match self {
            SyncOperation::Insert(row) => Ok(Some(row.clone())),
            SyncOperation::Update {
                market_address,
                patch,
                synced_at,
            } => {
                let mut row = current.cloned().ok_or(*market_address)?;
                patch.apply(&mut row, *synced_at);
                Ok(Some(row))
            }
            SyncOperation::NoOp { .. } => Ok(None),
        }
    }
}

/// Kind of divergence between cache and chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Drift {
    None,
    Missing,
    Volume,
    Status,
    VolumeAndStatus,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Chain says Resolved but the winner is absent or out of range.
    #[error(
        "market {market_address} is resolved on-chain with winner {raw_winner:?} of {option_count} options (cached {cached_status:?}/{cached_winner:?})"
    )]
    InconsistentResolution {
        market_address: Pubkey,
        raw_winner: Option<u8>,
        option_count: u8,
        cached_status: Option<MarketStatus>,
        cached_winner: Option<u8>,
    },
}

/// Cache row that exactly mirrors `snapshot`.
fn row_from_snapshot(snapshot: &ChainSnapshot, winner: Option<u8>) -> CacheRow {
    let market = &snapshot.market;
    CacheRow {
        market_address: market.address,
        total_volume: market.total_pool,
        option_pools: market.pools().to_vec(),
        participant_count: snapshot.participant_count,
        status: market.status,
        winning_option: winner,
        last_synced_at: snapshot.observed_at,
    }
}

fn diff(target: &CacheRow, cached: &CacheRow) -> RowPatch {
    RowPatch {
        total_volume: (target.total_volume != cached.total_volume).then_some(target.total_volume),
        option_pools: (target.option_pools != cached.option_pools)
            .then(|| target.option_pools.clone()),
        participant_count: (target.participant_count != cached.participant_count)
            .then_some(target.participant_count),
        status: (target.status != cached.status).then_some(target.status),
        winning_option: (target.winning_option != cached.winning_option)
            .then_some(target.winning_option),
    }
}

/// Compute the minimal operation that brings `cached` in line with `snapshot`.
pub fn reconcile(
    snapshot: &ChainSnapshot,
    cached: Option<&CacheRow>,
) -> Result<SyncOperation, ReconcileError> {
    let market = &snapshot.market;
    let winner = market
        .checked_winner()
        .map_err(|_| ReconcileError::InconsistentResolution {
            market_address: market.address,
            raw_winner: market.winning_option,
            option_count: market.option_count,
            cached_status: cached.map(|c| c.status),
            cached_winner: cached.and_then(|c| c.winning_option),
        })?;

    let target = row_from_snapshot(snapshot, winner);
    let Some(cached) = cached else {
        return Ok(SyncOperation::Insert(target));
    };

    let patch = diff(&target, cached);
    if patch.is_empty() {
        return Ok(SyncOperation::NoOp {
            market_address: market.address,
        });
    }
    Ok(SyncOperation::Update {
        market_address: market.address,
        patch,
        synced_at: snapshot.observed_at,
    })
}

/// Status-only comparison used by the on-demand repair path.
pub fn check_resolution_drift(market: &Market, cached: &CacheRow) -> bool {
    market.status != cached.status
}

/// Classify the divergence without building an operation.
pub fn classify(snapshot: &ChainSnapshot, cached: Option<&CacheRow>) -> Drift {
    let Some(cached) = cached else {
        return Drift::Missing;
    };
    let winner = snapshot.market.checked_winner().unwrap_or(None);
    let patch = diff(&row_from_snapshot(snapshot, winner), cached);
    match (patch.touches_volume(), patch.touches_status()) {
        (false, false) => Drift::None,
        (true, false) => Drift::Volume,
        (false, true) => Drift::Status,
        (true, true) => Drift::VolumeAndStatus,
    }
}

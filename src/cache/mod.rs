//! Off-chain market cache.
//!
//! One row per market address. Rows are derived from chain state and can be
//! rebuilt from scratch at any time; this crate only ever upserts them.
//!
//! Backends:
//! - `ValkeyCacheStore`: Valkey/Redis, rows as JSON under `{prefix}:market:{address}`
//! - `MemoryCacheStore`: process-local map, used when Valkey is unavailable and in tests

pub mod memory;
pub mod valkey;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::CacheConfig;
use crate::onchain::types::{MarketStatus, Pubkey};

pub use memory::MemoryCacheStore;
pub use valkey::ValkeyCacheStore;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
    #[error("row serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no cached row for {0}")]
    RowMissing(Pubkey),
    #[error("cache write rejected: {0}")]
    Rejected(String),
}

/// Cached aggregates for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRow {
    pub market_address: Pubkey,
    /// Token base units.
    pub total_volume: u64,
    pub option_pools: Vec<u64>,
    pub participant_count: u64,
    pub status: MarketStatus,
    pub winning_option: Option<u8>,
    pub last_synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, address: &Pubkey) -> Result<Option<CacheRow>, SyncError>;

    /// Insert or replace the row keyed by `row.market_address`.
    async fn upsert(&self, row: &CacheRow) -> Result<(), SyncError>;

    /// Every cached row, in no particular order.
    async fn rows(&self) -> Result<Vec<CacheRow>, SyncError>;
}

/// Connect to Valkey, or fall back to the in-process store when allowed.
pub async fn connect_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, SyncError> {
    let attempt = match ValkeyCacheStore::connect(&config.valkey_url, &config.prefix).await {
        Ok(store) => store.ping().await.map(|_| store),
        Err(e) => Err(e),
    };
    match attempt {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) if config.memory_fallback => {
            warn!(
                error = %e,
                url = %config.valkey_url,
                "failed to reach Valkey, using in-memory cache (rows are lost on restart)"
            );
            Ok(Arc::new(MemoryCacheStore::new()))
        }
        Err(e) => {
            error!(error = %e, url = %config.valkey_url, "failed to reach Valkey");
            Err(e)
        }
    }
}

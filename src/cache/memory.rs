use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{CacheRow, CacheStore, SyncError};
use crate::onchain::types::Pubkey;

/// Thread-safe in-process cache store.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    rows: Arc<DashMap<Pubkey, CacheRow>>,
    writes: Arc<AtomicUsize>,
    /// Addresses whose writes fail, for exercising error paths.
    rejected: Arc<DashSet<Pubkey>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `upsert` calls since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Make every subsequent write for `address` fail with `Rejected`.
    pub fn reject_writes_for(&self, address: Pubkey) {
        self.rejected.insert(address);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, address: &Pubkey) -> Result<Option<CacheRow>, SyncError> {
        Ok(self.rows.get(address).map(|r| r.clone()))
    }

    async fn upsert(&self, row: &CacheRow) -> Result<(), SyncError> {
        if self.rejected.contains(&row.market_address) {
            return Err(SyncError::Rejected(format!(
                "writes disabled for {}",
                row.market_address
            )));
        }
        self.rows.insert(row.market_address, row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rows(&self) -> Result<Vec<CacheRow>, SyncError> {
        Ok(self.rows.iter().map(|r| r.value().clone()).collect())
    }
}

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheRow, CacheStore, SyncError};
use crate::onchain::types::{MarketStatus, Pubkey, MAX_OPTIONS};
use crate::reconcile::SyncOperation;

/// What `apply` did to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted,
    Updated { fields: Vec<&'static str> },
    Unchanged,
}

/// Volume figures pushed by a client after it placed a prediction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReport {
    pub market_address: Pubkey,
    pub option_pools: Vec<u64>,
    #[serde(default)]
    pub total_volume: Option<u64>,
    #[serde(default)]
    pub participant_count: Option<u64>,
}

/// The only writer of cache rows.
#[derive(Clone)]
pub struct CacheSyncClient {
    store: Arc<dyn CacheStore>,
}

impl CacheSyncClient {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, address: &Pubkey) -> Result<Option<CacheRow>, SyncError> {
        self.store.get(address).await
    }

    pub async fn rows(&self) -> Result<Vec<CacheRow>, SyncError> {
        self.store.rows().await
    }

    /// Write the result of a reconciliation. Upserts keyed by market
    /// address; re-applying the same operation leaves the row identical.
    pub async fn apply(&self, op: &SyncOperation) -> Result<ApplyOutcome, SyncError> {
        match op {
            SyncOperation::NoOp { .. } => Ok(ApplyOutcome::Unchanged),
            SyncOperation::Insert(row) => {
                self.store.upsert(row).await?;
                info!(market = %row.market_address, status = %row.status, volume = row.total_volume, "inserted cache row");
                Ok(ApplyOutcome::Inserted)
            }
            SyncOperation::Update {
                market_address,
                patch,
                ..
            } => {
                let current = self.store.get(market_address).await?;
                let row = op
                    .target_row(current.as_ref())
                    .map_err(SyncError::RowMissing)?
                    .ok_or(SyncError::RowMissing(*market_address))?;
                self.store.upsert(&row).await?;
                let fields = patch.changed_fields();
                info!(market = %market_address, fields = ?fields, "updated cache row");
                Ok(ApplyOutcome::Updated { fields })
            }
        }
    }

    /// Upsert client-reported volumes. Status and winner of an existing row
    /// are left alone; a new row starts Active.
    pub async fn apply_volumes(&self, report: &VolumeReport) -> Result<ApplyOutcome, SyncError> {
        if report.option_pools.is_empty() || report.option_pools.len() > MAX_OPTIONS {
            return Err(SyncError::Rejected(format!(
                "optionPools must have 1..={} entries, got {}",
                MAX_OPTIONS,
                report.option_pools.len()
            )));
        }
        let total_volume = report.total_volume.unwrap_or_else(|| {
            report
                .option_pools
                .iter()
                .fold(0u64, |acc, p| acc.saturating_add(*p))
        });

        let existing = self.store.get(&report.market_address).await?;
        let (mut row, outcome) = match existing {
            Some(row) => {
                let participant_count = report.participant_count.unwrap_or(row.participant_count);
                if row.total_volume == total_volume
                    && row.option_pools == report.option_pools
                    && row.participant_count == participant_count
                {
                    debug!(market = %report.market_address, "volume report matches cache");
                    return Ok(ApplyOutcome::Unchanged);
                }
                let mut fields = Vec::new();
                if row.total_volume != total_volume {
                    fields.push("total_volume");
                }
                if row.option_pools != report.option_pools {
                    fields.push("option_pools");
                }
                if row.participant_count != participant_count {
                    fields.push("participant_count");
                }
                (row, ApplyOutcome::Updated { fields })
            }
            None => (
                CacheRow {
                    market_address: report.market_address,
                    total_volume: 0,
                    option_pools: Vec::new(),
                    participant_count: 0,
                    status: MarketStatus::Active,
                    winning_option: None,
                    last_synced_at: Utc::now(),
                },
                ApplyOutcome::Inserted,
            ),
        };

        row.total_volume = total_volume;
        row.option_pools = report.option_pools.clone();
        if let Some(c) = report.participant_count {
            row.participant_count = c;
        }
        row.last_synced_at = Utc::now();
        self.store.upsert(&row).await?;
        info!(market = %row.market_address, volume = row.total_volume, "applied volume report");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::reconcile::{reconcile, ChainSnapshot};
    use crate::testutil::{key, sample_market};

    fn client() -> (CacheSyncClient, MemoryCacheStore) {
        let store = MemoryCacheStore::new();
        (CacheSyncClient::new(Arc::new(store.clone())), store)
    }

    fn snapshot(total: u64) -> ChainSnapshot {
        let mut market = sample_market(1);
        market.option_pools = [total - 40, 40, 0, 0];
        market.total_pool = total;
        ChainSnapshot {
            market,
            participant_count: 2,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_apply_insert_then_update() {
        let (client, store) = client();
        let op = reconcile(&snapshot(100), None).unwrap();
        assert_eq!(client.apply(&op).await.unwrap(), ApplyOutcome::Inserted);

        let cached = client.get(&key(1)).await.unwrap();
        let op = reconcile(&snapshot(150), cached.as_ref()).unwrap();
        assert_eq!(
            client.apply(&op).await.unwrap(),
            ApplyOutcome::Updated { fields: vec!["total_volume", "option_pools"] }
        );
        let first = client.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(first.total_volume, 150);

        // Re-applying the same update is harmless.
        client.apply(&op).await.unwrap();
        assert_eq!(client.get(&key(1)).await.unwrap().unwrap(), first);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_noop_does_not_write() {
        let (client, store) = client();
        let op = SyncOperation::NoOp { market_address: key(1) };
        assert_eq!(client.apply(&op).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_update_without_row_fails() {
        let (client, _) = client();
        let row = reconcile(&snapshot(100), None).unwrap();
        let SyncOperation::Insert(mut cached) = row else {
            panic!("expected insert");
        };
        cached.total_volume = 1;
        let op = reconcile(&snapshot(100), Some(&cached)).unwrap();
        assert!(matches!(client.apply(&op).await, Err(SyncError::RowMissing(a)) if a == key(1)));
    }

    #[tokio::test]
    async fn test_volume_report_creates_active_row() {
        let (client, _) = client();
        let report = VolumeReport {
            market_address: key(9),
            option_pools: vec![30, 20],
            total_volume: None,
            participant_count: Some(4),
        };
        assert_eq!(client.apply_volumes(&report).await.unwrap(), ApplyOutcome::Inserted);
        let row = client.get(&key(9)).await.unwrap().unwrap();
        assert_eq!(row.total_volume, 50);
        assert_eq!(row.status, MarketStatus::Active);
        assert_eq!(row.participant_count, 4);

        assert_eq!(client.apply_volumes(&report).await.unwrap(), ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_volume_report_keeps_resolution() {
        let (client, _) = client();
        let mut market = sample_market(1);
        market.status = MarketStatus::Resolved;
        market.winning_option = Some(0);
        let snap = ChainSnapshot {
            market,
            participant_count: 2,
            observed_at: Utc::now(),
        };
        client.apply(&reconcile(&snap, None).unwrap()).await.unwrap();

        let report: VolumeReport = serde_json::from_value(serde_json::json!({
            "marketAddress": key(1).to_string(),
            "optionPools": [70, 40],
            "totalVolume": 110,
        }))
        .unwrap();
        client.apply_volumes(&report).await.unwrap();
        let row = client.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(row.total_volume, 110);
        assert_eq!(row.participant_count, 2);
        assert_eq!(row.status, MarketStatus::Resolved);
        assert_eq!(row.winning_option, Some(0));
    }

    #[tokio::test]
    async fn test_volume_report_rejects_too_many_pools() {
        let (client, store) = client();
        let report = VolumeReport {
            market_address: key(9),
            option_pools: vec![1, 2, 3, 4, 5],
            total_volume: None,
            participant_count: None,
        };
        assert!(matches!(client.apply_volumes(&report).await, Err(SyncError::Rejected(_))));
        assert!(store.is_empty());
    }
}

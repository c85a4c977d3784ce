//! Valkey (Redis-compatible) cache store.
//!
//! Data model:
//!   market:{address}   → JSON CacheRow
//!   markets            → SET of cached market addresses
//!
//! All keys are namespaced under a configurable prefix so several
//! deployments (devnet vs mainnet) can share one Valkey.
//! Default prefix: "market-sync" → keys like "market-sync:market:{address}".

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use super::{CacheRow, CacheStore, SyncError};
use crate::onchain::types::Pubkey;

#[derive(Clone)]
pub struct ValkeyCacheStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyCacheStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, SyncError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn row_key(&self, address: &Pubkey) -> String {
        self.key(&format!("market:{}", address))
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

/// Row write and index insert as one MULTI/EXEC transaction.
fn upsert_pipeline(row_key: &str, index_key: &str, address: &Pubkey, json: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .set(row_key, json)
        .ignore()
        .sadd(index_key, address.to_string())
        .ignore();
    pipe
}

#[async_trait]
impl CacheStore for ValkeyCacheStore {
    async fn get(&self, address: &Pubkey) -> Result<Option<CacheRow>, SyncError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.row_key(address)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, row: &CacheRow) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(row)?;
        let pipe = upsert_pipeline(
            &self.row_key(&row.market_address),
            &self.key("markets"),
            &row.market_address,
            &json,
        );
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(market = %row.market_address, status = %row.status, "stored cache row");
        Ok(())
    }

    async fn rows(&self) -> Result<Vec<CacheRow>, SyncError> {
        let mut conn = self.conn.clone();
        let addresses: Vec<String> = conn.smembers(self.key("markets")).await?;

        let mut rows = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let json: Option<String> = conn.get(self.key(&format!("market:{}", addr))).await?;
            match json.map(|j| serde_json::from_str::<CacheRow>(&j)) {
                Some(Ok(row)) => rows.push(row),
                Some(Err(e)) => warn!(market = %addr, error = %e, "skipping unreadable cache row"),
                None => warn!(market = %addr, "indexed market has no cache row"),
            }
        }
        Ok(rows)
    }
}

//! Enumeration of the market program's accounts.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::onchain::codec::{
    decode_position, AccountKind, DecodeError, ANCHOR_DISCRIMINATOR_LEN, PREDICTION_MARKET_OFFSET,
};
use crate::onchain::rpc::{AccountFilter, ChainClient, RawAccount, ScanError};
use crate::onchain::types::{Position, Pubkey};

/// Positions for one market, decoded, with the accounts that failed to decode.
#[derive(Debug, Default)]
pub struct PositionScan {
    pub positions: Vec<Position>,
    pub rejected: Vec<(Pubkey, DecodeError)>,
}

/// Issues filtered program-account queries against the ledger.
#[derive(Clone)]
pub struct ChainScanner {
    chain: Arc<dyn ChainClient>,
    program_id: Pubkey,
}

impl ChainScanner {
    pub fn new(chain: Arc<dyn ChainClient>, program_id: Pubkey) -> Self {
        Self { chain, program_id }
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    fn kind_filters(kind: AccountKind) -> Vec<AccountFilter> {
        vec![
            AccountFilter::DataSize(kind.size()),
            AccountFilter::Memcmp {
                offset: 0,
                bytes: kind.discriminator()[..ANCHOR_DISCRIMINATOR_LEN].to_vec(),
            },
        ]
    }

    /// Every Market account of the program, in node order.
    pub async fn scan_markets(&self) -> Result<impl Iterator<Item = RawAccount>, ScanError> {
        let filters = Self::kind_filters(AccountKind::Market);
        let accounts = self
            .chain
            .get_program_accounts(&self.program_id, &filters)
            .await?;
        debug!(count = accounts.len(), "scanned market accounts");
        Ok(accounts.into_iter())
    }

    /// Every Prediction account that references `market`.
    pub async fn scan_positions_for_market(
        &self,
        market: &Pubkey,
    ) -> Result<impl Iterator<Item = RawAccount>, ScanError> {
        let mut filters = Self::kind_filters(AccountKind::Prediction);
        filters.push(AccountFilter::Memcmp {
            offset: PREDICTION_MARKET_OFFSET,
            bytes: market.as_bytes().to_vec(),
        });
        let accounts = self
            .chain
            .get_program_accounts(&self.program_id, &filters)
            .await?;
        debug!(market = %market, count = accounts.len(), "scanned prediction accounts");
        Ok(accounts.into_iter())
    }

    /// Scan and decode a market's positions. Undecodable accounts are
    /// reported, not fatal.
    pub async fn load_positions(&self, market: &Pubkey) -> Result<PositionScan, ScanError> {
        let mut scan = PositionScan::default();
        for raw in self.scan_positions_for_market(market).await? {
            match decode_position(raw.address, &raw.data) {
                Ok(position) => scan.positions.push(position),
                Err(e) => {
                    warn!(account = %raw.address, market = %market, error = %e, "skipping undecodable prediction");
                    scan.rejected.push((raw.address, e));
                }
            }
        }
        Ok(scan)
    }

    /// Read one market account directly.
    pub async fn fetch_market(&self, address: &Pubkey) -> Result<RawAccount, ScanError> {
        let raw = self
            .chain
            .get_account_info(address)
            .await?
            .ok_or(ScanError::AccountNotFound(*address))?;
        if raw.owner != self.program_id {
            return Err(ScanError::WrongOwner {
                address: *address,
                owner: raw.owner,
                expected: self.program_id,
            });
        }
        Ok(raw)
    }
}

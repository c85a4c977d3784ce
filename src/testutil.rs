//! Fixtures and test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::onchain::codec::encode::{encode_market, encode_position};
use crate::onchain::rpc::{AccountFilter, ChainClient, RawAccount, ScanError};
use crate::onchain::types::{Market, MarketKind, MarketRawBytes, MarketStatus, Position, Pubkey};

pub const PROGRAM: Pubkey = Pubkey::new([0xAB; 32]);

pub fn key(n: u8) -> Pubkey {
    Pubkey::new([n; 32])
}

/// An Active binary market at address `key(seed)` with pools 60/40.
pub fn sample_market(seed: u8) -> Market {
    Market {
        address: key(seed),
        authority: key(200),
        creator: key(201),
        kind: MarketKind::Binary,
        question: format!("Will team {seed} win the final?"),
        question_len: 28,
        option_labels: [
            "Yes".to_string(),
            "No".to_string(),
            String::new(),
            String::new(),
        ],
        option_count: 2,
        resolution_date: 1_750_000_000,
        creator_fee_rate: 250,
        min_bet_amount: 1_000_000,
        token_mint: key(202),
        status: MarketStatus::Active,
        winning_option: None,
        option_pools: [60, 40, 0, 0],
        total_pool: 100,
        market_id: format!("mkt-{seed}"),
        category: "sports".to_string(),
        raw: MarketRawBytes::default(),
    }
}

pub fn sample_position(market: Pubkey, owner: Pubkey, option_index: u8, amount: u64) -> Position {
    let mut addr = [0xAAu8; 32];
    addr[0] = market.0[0];
    addr[1] = owner.0[0];
    addr[2] = option_index;
    Position {
        address: Pubkey::new(addr),
        owner,
        market,
        option_index,
        amount,
        placed_at: 1_740_000_000,
        claimed: false,
        bump: 254,
    }
}

/// In-memory ledger that evaluates RPC filters locally.
#[derive(Default)]
pub struct FakeChain {
    accounts: Mutex<HashMap<Pubkey, RawAccount>>,
    order: Mutex<Vec<Pubkey>>,
    unfiltered: Mutex<HashSet<Pubkey>>,
    program_scans: AtomicUsize,
    account_reads: AtomicUsize,
    fail_scans: AtomicBool,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace an account. Scan order follows first insertion.
    pub fn put_raw(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        let mut accounts = self.accounts.lock().unwrap();
        if !accounts.contains_key(&address) {
            self.order.lock().unwrap().push(address);
        }
        accounts.insert(address, RawAccount { address, owner, data });
    }

    pub fn put_market(&self, market: &Market) {
        self.put_raw(market.address, PROGRAM, encode_market(market));
    }

    pub fn put_position(&self, position: &Position) {
        self.put_raw(position.address, PROGRAM, encode_position(position));
    }

    /// Insert an account that every program scan returns regardless of
    /// filters, like a node that ignores `dataSize`.
    pub fn put_unfiltered(&self, address: Pubkey, data: Vec<u8>) {
        self.unfiltered.lock().unwrap().insert(address);
        self.put_raw(address, PROGRAM, data);
    }

    pub fn fail_program_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    pub fn program_scans(&self) -> usize {
        self.program_scans.load(Ordering::SeqCst)
    }

    pub fn account_reads(&self) -> usize {
        self.account_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<RawAccount>, ScanError> {
        self.program_scans.fetch_add(1, Ordering::SeqCst);
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(ScanError::Rpc {
                code: -32005,
                message: "node is behind".to_string(),
            });
        }
        let accounts = self.accounts.lock().unwrap();
        let order = self.order.lock().unwrap();
        let unfiltered = self.unfiltered.lock().unwrap();
        Ok(order
            .iter()
            .filter_map(|addr| accounts.get(addr))
            .filter(|a| a.owner == *program_id)
            .filter(|a| {
                unfiltered.contains(&a.address) || filters.iter().all(|f| f.matches(&a.data))
            })
            .cloned()
            .collect())
    }

    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RawAccount>, ScanError> {
        self.account_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }
}

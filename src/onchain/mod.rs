//! Read side of the market program on Solana.
//!
//! - `codec`: decodes Market and Prediction accounts from raw bytes through a
//!   discriminator-keyed schema table
//! - `rpc`: the `ChainClient` seam and its JSON-RPC implementation
//! - `scanner`: filtered `getProgramAccounts` queries (markets by size,
//!   predictions by embedded market key) and single-account reads
//! - `types`: typed Market / Position records and the `Pubkey` newtype
//!
//! Nothing in this module writes to the ledger.

pub mod codec;
pub mod rpc;
pub mod scanner;
pub mod types;

pub use codec::{decode_market, decode_position, AccountKind, DecodeError};
pub use rpc::{AccountFilter, ChainClient, RawAccount, RpcChainClient, ScanError};
pub use scanner::{ChainScanner, PositionScan};
pub use types::{Market, MarketKind, MarketRawBytes, MarketStatus, Position, Pubkey};

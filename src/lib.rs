//! Chain-state decoding and cache reconciliation for the prediction market
//! program.
//!
//! Both binaries (`market-sync` and `sync-once`) are thin shells over these
//! modules.

pub mod api;
pub mod cache;
pub mod config;
pub mod live;
pub mod onchain;
pub mod participants;
pub mod reconcile;
pub mod repair;
pub mod sync;

#[cfg(test)]
mod testutil;

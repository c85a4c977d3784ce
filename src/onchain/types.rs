//! Typed views of the market program's accounts.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::onchain::codec::DecodeError;

pub const PUBKEY_LEN: usize = 32;
pub const MAX_OPTIONS: usize = 4;

/// A 32-byte account address, shown as base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pubkey(pub [u8; PUBKEY_LEN]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubkeyError {
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl Pubkey {
    pub const fn new(bytes: [u8; PUBKEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl FromStr for Pubkey {
    type Err = PubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| PubkeyError::Base58(e.to_string()))?;
        let arr: [u8; PUBKEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PubkeyError::Length(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self.to_base58())
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Binary,
    MultiOption,
}

impl MarketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Binary),
            1 => Some(Self::MultiOption),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::MultiOption => 1,
        }
    }
}

/// Lifecycle status of a market as recorded on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketStatus {
    Active,
    Resolved,
    Cancelled,
}

impl MarketStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Active),
            1 => Some(Self::Resolved),
            2 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Resolved => 1,
            Self::Cancelled => 2,
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Active => write!(f, "Active"),
            MarketStatus::Resolved => write!(f, "Resolved"),
            MarketStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A decoded Market account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    pub address: Pubkey,
    pub authority: Pubkey,
    pub creator: Pubkey,
    pub kind: MarketKind,
    pub question: String,
    /// Length the program recorded for `question`; kept as stored.
    pub question_len: u16,
    /// All four label slots. Only the first `option_count` are meaningful.
    pub option_labels: [String; MAX_OPTIONS],
    pub option_count: u8,
    pub resolution_date: i64,
    /// Basis points.
    pub creator_fee_rate: u64,
    pub min_bet_amount: u64,
    pub token_mint: Pubkey,
    pub status: MarketStatus,
    /// Raw winner as stored. Use `checked_winner` before trusting it.
    pub winning_option: Option<u8>,
    pub option_pools: [u64; MAX_OPTIONS],
    pub total_pool: u64,
    pub market_id: String,
    pub category: String,
    /// Bytes the typed fields do not capture, kept so the account can be
    /// written back exactly as read.
    pub raw: MarketRawBytes,
}

/// Layout details of a stored Market that carry no meaning of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketRawBytes {
    /// Presence tag of `winning_option` when it was neither 0 nor 1.
    pub winner_tag: Option<u8>,
    /// Reserve after `category`, with trailing zeros dropped.
    pub reserved: Vec<u8>,
}

impl Market {
    pub fn labels(&self) -> &[String] {
        &self.option_labels[..self.option_count as usize]
    }

    pub fn pools(&self) -> &[u64] {
        &self.option_pools[..self.option_count as usize]
    }

    /// Sum of the active option pools, saturating.
    pub fn pool_sum(&self) -> u64 {
        self.pools().iter().fold(0u64, |acc, p| acc.saturating_add(*p))
    }

    /// The winner, validated against status and option count.
    ///
    /// Resolved markets must carry a winner below `option_count`; anything
    /// else is `InconsistentResolution`. Non-resolved markets report `None`
    /// regardless of what the tag byte says.
    pub fn checked_winner(&self) -> Result<Option<u8>, DecodeError> {
        match (self.status, self.winning_option) {
            (MarketStatus::Resolved, Some(idx)) if idx < self.option_count => Ok(Some(idx)),
            (MarketStatus::Resolved, raw) => Err(DecodeError::InconsistentResolution {
                winning_option: raw,
                option_count: self.option_count,
            }),
            _ => Ok(None),
        }
    }
}

/// A decoded Prediction account: one owner's stake on one option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub address: Pubkey,
    pub owner: Pubkey,
    pub market: Pubkey,
    pub option_index: u8,
    pub amount: u64,
    pub placed_at: i64,
    pub claimed: bool,
    pub bump: u8,
}

impl Position {
    /// (market, owner, option) identifies at most one position.
    pub fn key(&self) -> (Pubkey, Pubkey, u8) {
        (self.market, self.owner, self.option_index)
    }
}

//! Binary decoding of the market program's Anchor accounts.
//!
//! Every account starts with an 8-byte discriminator,
//! `sha256("account:<Name>")[..8]`. The discriminator selects an entry in the
//! schema table below, which fixes the record size and the decode function.
//! Field layout is Borsh: little-endian integers, raw 32-byte keys,
//! fixed-capacity NUL-padded text, and `Option<u8>` as a tag byte followed by
//! the value byte only when the tag is non-zero.
//!
//! Because a `None` winner is one byte shorter than `Some`, every Market field
//! after `winning_option` moves with it. Decoding therefore walks a cursor and
//! never indexes absolute offsets past that point.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::onchain::types::{
    Market, MarketKind, MarketRawBytes, MarketStatus, Position, Pubkey, MAX_OPTIONS, PUBKEY_LEN,
};

pub const ANCHOR_DISCRIMINATOR_LEN: usize = 8;

pub const QUESTION_LEN: usize = 200;
pub const OPTION_LABEL_LEN: usize = 50;
pub const MARKET_ID_LEN: usize = 32;
pub const CATEGORY_LEN: usize = 20;

/// Allocated size of a Market account. The serialized fields occupy at most
/// 627 bytes; the remainder is reserve, normally zeroed.
pub const MARKET_ACCOUNT_LEN: usize = 691;

/// Size of a Prediction account.
pub const PREDICTION_ACCOUNT_LEN: usize = 91;

/// Byte offset of the owner key inside a Prediction account.
pub const PREDICTION_OWNER_OFFSET: usize = ANCHOR_DISCRIMINATOR_LEN;
/// Byte offset of the market key inside a Prediction account.
pub const PREDICTION_MARKET_OFFSET: usize = ANCHOR_DISCRIMINATOR_LEN + PUBKEY_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("account truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown account discriminator {0:02x?}")]
    UnknownDiscriminator([u8; ANCHOR_DISCRIMINATOR_LEN]),
    #[error("expected {expected:?} account, found {found:?}")]
    WrongAccountKind { expected: AccountKind, found: AccountKind },
    #[error("field `{field}` is not valid UTF-8")]
    InvalidText { field: &'static str },
    #[error("field `{field}` has invalid value {value}")]
    InvalidEnum { field: &'static str, value: u8 },
    #[error("option count {0} outside 1..=4")]
    InvalidOptionCount(u8),
    #[error("field `{field}` has invalid bool byte {value}")]
    InvalidBool { field: &'static str, value: u8 },
    #[error("resolved market has winner {winning_option:?} with {option_count} options")]
    InconsistentResolution {
        winning_option: Option<u8>,
        option_count: u8,
    },
}

/// Account types owned by the market program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKind {
    Market,
    Prediction,
}

/// One row of the schema table.
#[derive(Debug, Clone, Copy)]
pub struct AccountSchema {
    pub kind: AccountKind,
    pub name: &'static str,
    pub size: usize,
}

pub const ACCOUNT_SCHEMAS: &[AccountSchema] = &[
    AccountSchema {
        kind: AccountKind::Market,
        name: "Market",
        size: MARKET_ACCOUNT_LEN,
    },
    AccountSchema {
        kind: AccountKind::Prediction,
        name: "Prediction",
        size: PREDICTION_ACCOUNT_LEN,
    },
];

impl AccountKind {
    pub fn schema(self) -> &'static AccountSchema {
        match self {
            AccountKind::Market => &ACCOUNT_SCHEMAS[0],
            AccountKind::Prediction => &ACCOUNT_SCHEMAS[1],
        }
    }

    pub fn size(self) -> usize {
        self.schema().size
    }

    /// Anchor account discriminator: first 8 bytes of sha256("account:<Name>").
    pub fn discriminator(self) -> [u8; ANCHOR_DISCRIMINATOR_LEN] {
        let digest = Sha256::digest(format!("account:{}", self.schema().name).as_bytes());
        let mut out = [0u8; ANCHOR_DISCRIMINATOR_LEN];
        out.copy_from_slice(&digest[..ANCHOR_DISCRIMINATOR_LEN]);
        out
    }

    /// Look up the account kind for a raw account buffer.
    pub fn identify(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < ANCHOR_DISCRIMINATOR_LEN {
            return Err(DecodeError::Truncated {
                expected: ANCHOR_DISCRIMINATOR_LEN,
                actual: data.len(),
            });
        }
        let mut disc = [0u8; ANCHOR_DISCRIMINATOR_LEN];
        disc.copy_from_slice(&data[..ANCHOR_DISCRIMINATOR_LEN]);
        ACCOUNT_SCHEMAS
            .iter()
            .map(|s| s.kind)
            .find(|kind| kind.discriminator() == disc)
            .ok_or(DecodeError::UnknownDiscriminator(disc))
    }
}

fn check_header(data: &[u8], expected: AccountKind) -> Result<(), DecodeError> {
    let size = expected.size();
    if data.len() < size {
        return Err(DecodeError::Truncated {
            expected: size,
            actual: data.len(),
        });
    }
    let found = AccountKind::identify(data)?;
    if found != expected {
        return Err(DecodeError::WrongAccountKind { expected, found });
    }
    Ok(())
}

/// Decode a Market account.
pub fn decode_market(address: Pubkey, data: &[u8]) -> Result<Market, DecodeError> {
    check_header(data, AccountKind::Market)?;
    let mut r = Reader::new(&data[..MARKET_ACCOUNT_LEN], ANCHOR_DISCRIMINATOR_LEN);

    let authority = r.pubkey()?;
    let creator = r.pubkey()?;
    let kind_byte = r.u8()?;
    let kind = MarketKind::from_byte(kind_byte).ok_or(DecodeError::InvalidEnum {
        field: "market_type",
        value: kind_byte,
    })?;
    let question = r.text("question", QUESTION_LEN)?;
    let question_len = r.u16()?;
    let option_labels = [
        r.text("option_1", OPTION_LABEL_LEN)?,
        r.text("option_2", OPTION_LABEL_LEN)?,
        r.text("option_3", OPTION_LABEL_LEN)?,
        r.text("option_4", OPTION_LABEL_LEN)?,
    ];
    let option_count = r.u8()?;
    if option_count == 0 || option_count as usize > MAX_OPTIONS {
        return Err(DecodeError::InvalidOptionCount(option_count));
    }
    let resolution_date = r.i64()?;
    let creator_fee_rate = r.u64()?;
    let min_bet_amount = r.u64()?;
    let token_mint = r.pubkey()?;
    let status_byte = r.u8()?;
    let status = MarketStatus::from_byte(status_byte).ok_or(DecodeError::InvalidEnum {
        field: "status",
        value: status_byte,
    })?;
    let (winning_option, tag) = decode_winning_option(&mut r)?;
    let option_pools = [r.u64()?, r.u64()?, r.u64()?, r.u64()?];
    let total_pool = r.u64()?;
    let market_id = r.text("market_id", MARKET_ID_LEN)?;
    let category = r.text("category", CATEGORY_LEN)?;
    let reserved = r.rest_trimmed();

    Ok(Market {
        address,
        authority,
        creator,
        kind,
        question,
        question_len,
        option_labels,
        option_count,
        resolution_date,
        creator_fee_rate,
        min_bet_amount,
        token_mint,
        status,
        winning_option,
        option_pools,
        total_pool,
        market_id,
        category,
        raw: MarketRawBytes {
            winner_tag: (tag > 1).then_some(tag),
            reserved,
        },
    })
}

/// Decode a Prediction account.
pub fn decode_position(address: Pubkey, data: &[u8]) -> Result<Position, DecodeError> {
    check_header(data, AccountKind::Prediction)?;
    let mut r = Reader::new(&data[..PREDICTION_ACCOUNT_LEN], ANCHOR_DISCRIMINATOR_LEN);

    let owner = r.pubkey()?;
    let market = r.pubkey()?;
    let option_index = r.u8()?;
    let amount = r.u64()?;
    let placed_at = r.i64()?;
    let claimed = r.bool("claimed")?;
    let bump = r.u8()?;

    Ok(Position {
        address,
        owner,
        market,
        option_index,
        amount,
        placed_at,
        claimed,
        bump,
    })
}

/// `Option<u8>` as Borsh writes it: tag 0 is `None`, any other tag means the
/// next byte is the value. This is the only place the tag is interpreted.
/// Returns the raw tag alongside the value.
fn decode_winning_option(r: &mut Reader<'_>) -> Result<(Option<u8>, u8), DecodeError> {
    match r.u8()? {
        0 => Ok((None, 0)),
        tag => Ok((Some(r.u8()?), tag)),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                expected: end,
                actual: self.data.len(),
            });
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { field, value }),
        }
    }

    fn pubkey(&mut self) -> Result<Pubkey, DecodeError> {
        Ok(Pubkey::new(self.array()?))
    }

    /// Everything after the cursor, trailing zeros dropped.
    fn rest_trimmed(&mut self) -> Vec<u8> {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        let end = rest.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        rest[..end].to_vec()
    }

    fn text(&mut self, field: &'static str, len: usize) -> Result<String, DecodeError> {
        let raw = self.take(len)?;
        let end = raw.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        std::str::from_utf8(&raw[..end])
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidText { field })
    }
}

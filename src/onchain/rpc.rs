//! Read-only Solana JSON-RPC access.
//!
//! `ChainClient` is the seam between the sync engine and the ledger. The
//! production implementation speaks JSON-RPC over HTTP with base64 account
//! encoding; tests substitute an in-memory ledger.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::onchain::types::Pubkey;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
    #[error("account {0} not found")]
    AccountNotFound(Pubkey),
    #[error("account {address} is owned by {owner}, expected {expected}")]
    WrongOwner {
        address: Pubkey,
        owner: Pubkey,
        expected: Pubkey,
    },
}

/// Server-side filter for `getProgramAccounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountFilter {
    DataSize(usize),
    Memcmp { offset: usize, bytes: Vec<u8> },
}

impl AccountFilter {
    /// Evaluate the filter locally, with the same semantics the RPC node uses.
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            AccountFilter::DataSize(size) => data.len() == *size,
            AccountFilter::Memcmp { offset, bytes } => data
                .get(*offset..offset + bytes.len())
                .map_or(false, |window| window == bytes.as_slice()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            AccountFilter::DataSize(size) => json!({ "dataSize": size }),
            AccountFilter::Memcmp { offset, bytes } => json!({
                "memcmp": {
                    "offset": offset,
                    "bytes": bs58::encode(bytes).into_string(),
                }
            }),
        }
    }
}

/// An account as returned by the node: address, owning program and raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAccount {
    pub address: Pubkey,
    pub owner: Pubkey,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// All accounts owned by `program_id` that pass every filter.
    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<RawAccount>, ScanError>;

    /// A single account, or `None` if it does not exist.
    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RawAccount>, ScanError>;
}

/// JSON-RPC client for a Solana node.
pub struct RpcChainClient {
    http: reqwest::Client,
    url: String,
    commitment: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct KeyedAccount {
    pubkey: String,
    account: UiAccount,
}

#[derive(Debug, Deserialize)]
struct UiAccount {
    /// `[payload, encoding]`
    data: (String, String),
    owner: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfoResult {
    value: Option<UiAccount>,
}

impl RpcChainClient {
    /// `timeout` bounds each HTTP request; the sync engine itself never times out RPC calls.
    pub fn new(url: String, commitment: String, timeout: Duration) -> Result<Self, ScanError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            commitment,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ScanError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp: RpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(ScanError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        resp.result
            .ok_or_else(|| ScanError::Malformed(format!("{method}: missing result")))
    }

    fn decode_account(address: Pubkey, account: UiAccount) -> Result<RawAccount, ScanError> {
        let (payload, encoding) = account.data;
        if encoding != "base64" {
            return Err(ScanError::Malformed(format!(
                "unexpected account encoding {encoding}"
            )));
        }
        let data = BASE64
            .decode(payload.as_bytes())
            .map_err(|e| ScanError::Malformed(format!("account {address}: {e}")))?;
        let owner = account
            .owner
            .parse()
            .map_err(|e| ScanError::Malformed(format!("owner of {address}: {e}")))?;
        Ok(RawAccount {
            address,
            owner,
            data,
        })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<RawAccount>, ScanError> {
        let filters: Vec<Value> = filters.iter().map(AccountFilter::to_json).collect();
        let params = json!([
            program_id.to_string(),
            {
                "encoding": "base64",
                "commitment": self.commitment,
                "filters": filters,
            }
        ]);

        let keyed: Vec<KeyedAccount> = self.call("getProgramAccounts", params).await?;
        debug!(program = %program_id, accounts = keyed.len(), "getProgramAccounts");

        keyed
            .into_iter()
            .map(|k| {
                let address = k
                    .pubkey
                    .parse()
                    .map_err(|e| ScanError::Malformed(format!("pubkey {}: {e}", k.pubkey)))?;
                Self::decode_account(address, k.account)
            })
            .collect()
    }

    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RawAccount>, ScanError> {
        let params = json!([
            address.to_string(),
            { "encoding": "base64", "commitment": self.commitment }
        ]);
        let info: AccountInfoResult = self.call("getAccountInfo", params).await?;
        info.value
            .map(|account| Self::decode_account(*address, account))
            .transpose()
    }
}

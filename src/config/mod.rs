use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::onchain::types::{Pubkey, PubkeyError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid program id: {0}")]
    ProgramId(#[from] PubkeyError),
    #[error("unknown network {0:?} (expected devnet or mainnet)")]
    UnknownNetwork(String),
}

/// Cluster preset. Picks the default program id and RPC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Devnet,
    Mainnet,
}

impl Network {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "devnet" => Ok(Network::Devnet),
            "mainnet" | "mainnet-beta" => Ok(Network::Mainnet),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }

    pub fn default_program_id(self) -> &'static str {
        match self {
            Network::Devnet => "F3cFKHXtoYeTnKE6hd7iy21oAZFGyz7dm2WQKS31M46Y",
            Network::Mainnet => "APESCaeLW5RuxNnpNARtDZnSgeVFC5f37Z3VFNKupJUS",
        }
    }

    /// Decimals of the betting token on this network.
    pub fn token_decimals(self) -> u32 {
        match self {
            Network::Devnet => 6,
            Network::Mainnet => 9,
        }
    }

    pub fn default_rpc_url(self) -> &'static str {
        match self {
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_network")]
    pub network: Network,
    /// JSON-RPC endpoint. Empty = the network's public endpoint.
    /// Overridden by env SOLANA_RPC_URL.
    #[serde(default)]
    pub url: String,
    /// Market program id (base58). Empty = the network's deployment.
    /// Overridden by env PROGRAM_ID.
    #[serde(default)]
    pub program_id: String,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Valkey connection URL (e.g. "redis://127.0.0.1:6379").
    #[serde(default = "default_valkey_url")]
    pub valkey_url: String,
    /// Key prefix for all Valkey keys.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Fall back to an in-process store when Valkey is unreachable.
    #[serde(default = "default_true")]
    pub memory_fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Pause between markets, in milliseconds.
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
    /// Full batch interval. 0 disables the periodic batch.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Resolution sweep interval. 0 disables it.
    #[serde(default = "default_resolution_sweep_interval")]
    pub resolution_sweep_interval_secs: u64,
    /// How long a live read is served from memory.
    #[serde(default = "default_live_ttl")]
    pub live_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_network() -> Network {
    Network::Devnet
}
fn default_commitment() -> String {
    "confirmed".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_prefix() -> String {
    "market-sync".to_string()
}
fn default_true() -> bool {
    true
}
fn default_pace_ms() -> u64 {
    100
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_resolution_sweep_interval() -> u64 {
    60
}
fn default_live_ttl() -> u64 {
    30
}
fn default_bind() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            url: String::new(),
            program_id: String::new(),
            commitment: default_commitment(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            valkey_url: default_valkey_url(),
            prefix: default_prefix(),
            memory_fallback: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pace_ms: default_pace_ms(),
            sweep_interval_secs: default_sweep_interval(),
            resolution_sweep_interval_secs: default_resolution_sweep_interval(),
            live_ttl_secs: default_live_ttl(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl RpcConfig {
    pub fn rpc_url(&self) -> &str {
        if self.url.is_empty() {
            self.network.default_rpc_url()
        } else {
            &self.url
        }
    }

    pub fn program_id(&self) -> Result<Pubkey, ConfigError> {
        let raw = if self.program_id.is_empty() {
            self.network.default_program_id()
        } else {
            &self.program_id
        };
        Ok(raw.parse()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_decimals(&self) -> u32 {
        self.network.token_decimals()
    }
}

impl SyncConfig {
    pub fn live_ttl(&self) -> Duration {
        Duration::from_secs(self.live_ttl_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults overlaid with environment variables (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            rpc: RpcConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(network) = var("SOLANA_NETWORK") {
            self.rpc.network = Network::parse(&network)?;
        }
        if let Some(url) = var("SOLANA_RPC_URL") {
            self.rpc.url = url;
        }
        if let Some(program) = var("PROGRAM_ID") {
            self.rpc.program_id = program;
        }
        if let Some(url) = var("VALKEY_URL") {
            self.cache.valkey_url = url;
        }
        if let Some(bind) = var("BIND_ADDR") {
            self.server.bind = bind;
        }
        if self.rpc.network == Network::Mainnet && self.rpc.url.is_empty() {
            return Err(ConfigError::MissingEnv("SOLANA_RPC_URL".to_string()));
        }
        Ok(())
    }
}

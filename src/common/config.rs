//! Configuration for pixel-indexer
//!
//! Loaded from an optional TOML file (`$PIXEL_INDEXER_CONFIG`, default
//! `pixel-indexer.toml`) and `PIXEL_INDEXER__SECTION__FIELD` environment
//! variables. CLI flags are applied on top by the binary.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "PIXEL_INDEXER_CONFIG";

/// Config file used when `CONFIG_ENV` is unset
pub const DEFAULT_CONFIG_FILE: &str = "pixel-indexer.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger RPC collaborator
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Ingestion pipeline
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Public HTTP API
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            indexer: IndexerConfig::default(),
            api: ApiConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from file + environment. A missing file is not an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("PIXEL_INDEXER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        settings
            .try_deserialize::<Config>()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.indexer.validate()?;
        self.api.validate(self.indexer.resolution)?;
        if self.ledger.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "ledger.request_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Ledger collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// HTTP JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// WebSocket endpoint for push subscriptions (polling only when absent)
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Canvas contract address (0x-hex)
    #[serde(default)]
    pub contract_address: String,

    /// topic0 of the pixel placement event (0x-hex)
    #[serde(default)]
    pub event_topic: String,

    /// Deployment block of the contract; the first position ever scanned
    #[serde(default)]
    pub origin_position: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_request_timeout() -> u64 {
    10_000
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            ws_url: None,
            contract_address: String::new(),
            event_topic: String::new(),
            origin_position: 0,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl LedgerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Canvas side length; keys are `x + y * resolution`
    #[serde(default = "default_resolution")]
    pub resolution: u32,

    /// Positions per range query
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Backfill chunks in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per chunk before it is recorded as a gap
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Poll interval while no push subscription is connected
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Safety poll interval while a push subscription is connected
    #[serde(default = "default_watch_poll_interval")]
    pub watch_poll_interval_ms: u64,

    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    /// Snapshot file
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Flush after this long without a mutation
    #[serde(default = "default_quiet_period")]
    pub snapshot_quiet_period_ms: u64,

    /// Flush at the latest this long after the first unsaved mutation
    #[serde(default = "default_max_staleness")]
    pub snapshot_max_staleness_ms: u64,
}

fn default_resolution() -> u32 {
    1024
}
fn default_chunk_size() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    8_000
}
fn default_poll_interval() -> u64 {
    500
}
fn default_watch_poll_interval() -> u64 {
    5_000
}
fn default_reconnect_base_delay() -> u64 {
    1_000
}
fn default_reconnect_max_delay() -> u64 {
    30_000
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./indexer-data/pixels.snap")
}
fn default_quiet_period() -> u64 {
    2_000
}
fn default_max_staleness() -> u64 {
    30_000
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            poll_interval_ms: default_poll_interval(),
            watch_poll_interval_ms: default_watch_poll_interval(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            snapshot_path: default_snapshot_path(),
            snapshot_quiet_period_ms: default_quiet_period(),
            snapshot_max_staleness_ms: default_max_staleness(),
        }
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 || !self.resolution.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "indexer.resolution must be a power of two, got {}",
                self.resolution
            )));
        }
        // keys must fit in u64 and coordinates in u32
        if self.resolution > (1 << 16) {
            return Err(Error::InvalidConfig(format!(
                "indexer.resolution too large: {}",
                self.resolution
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("indexer.chunk_size must be > 0".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("indexer.concurrency must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("indexer.max_retries must be > 0".into()));
        }
        if self.poll_interval_ms == 0 || self.watch_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("poll intervals must be > 0".into()));
        }
        if self.snapshot_max_staleness_ms < self.snapshot_quiet_period_ms {
            return Err(Error::InvalidConfig(
                "snapshot_max_staleness_ms must be >= snapshot_quiet_period_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.snapshot_quiet_period_ms)
    }
    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.snapshot_max_staleness_ms)
    }
}

/// Public API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Largest region (width * height) served by `/region`
    #[serde(default = "default_max_region_area")]
    pub max_region_area: u64,

    /// Largest width or height served by `/region`
    #[serde(default = "default_max_region_dimension")]
    pub max_region_dimension: u32,

    /// Pending records per push-stream subscriber before it is dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}
fn default_max_region_area() -> u64 {
    262_144
}
fn default_max_region_dimension() -> u32 {
    1024
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_heartbeat_interval() -> u64 {
    15_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_region_area: default_max_region_area(),
            max_region_dimension: default_max_region_dimension(),
            subscriber_buffer: default_subscriber_buffer(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self, resolution: u32) -> Result<()> {
        if self.max_region_area == 0 || self.max_region_dimension == 0 {
            return Err(Error::InvalidConfig("region limits must be > 0".into()));
        }
        if self.max_region_dimension > resolution {
            return Err(Error::InvalidConfig(format!(
                "api.max_region_dimension {} exceeds resolution {}",
                self.max_region_dimension, resolution
            )));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::InvalidConfig("api.subscriber_buffer must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "api.heartbeat_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

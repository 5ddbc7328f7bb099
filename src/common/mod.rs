//! Common utilities and types shared across pixel-indexer

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ApiConfig, Config, IndexerConfig, LedgerConfig};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{
    format_bytes, parse_duration, retry_with_backoff, shutdown_signalled, timestamp_now_millis,
    Backoff,
};

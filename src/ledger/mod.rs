//! Ledger collaborator
//!
//! The indexer consumes the canvas contract's placement events through the
//! [`Ledger`] trait:
//! - `current_head`: latest log position (block height)
//! - `query_range`: entries in an inclusive position range
//! - `watch`: push stream of new entries, or `Error::WatchUnavailable` when the
//!   caller has to fall back to polling
//!
//! Entries arrive loosely typed. Every field is optional and the indexer's
//! normalization step decides whether an entry is usable.

pub mod memory;
pub mod rpc;

use crate::common::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use memory::MemoryLedger;
pub use rpc::RpcLedger;

/// Push stream of ledger entries. Ends or yields an error when the transport drops.
pub type EntryStream = BoxStream<'static, Result<LedgerEntry>>;

/// A placement event as reported by the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user: Option<String>,
    pub x: Option<u64>,
    pub y: Option<u64>,
    pub color: Option<u64>,
    pub timestamp: Option<u64>,
    pub position: Option<u64>,
    /// Ordinal of the event inside its position
    pub log_index: Option<u64>,
}

impl LedgerEntry {
    /// Fully populated entry
    pub fn placement(
        user: impl Into<String>,
        x: u64,
        y: u64,
        color: u64,
        timestamp: u64,
        position: u64,
        log_index: u64,
    ) -> Self {
        Self {
            user: Some(user.into()),
            x: Some(x),
            y: Some(y),
            color: Some(color),
            timestamp: Some(timestamp),
            position: Some(position),
            log_index: Some(log_index),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Latest position the ledger has produced
    async fn current_head(&self) -> Result<u64>;

    /// Entries with `from <= position <= to`
    async fn query_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>>;

    /// Subscribe to entries at or after `from` as they are appended
    async fn watch(&self, from: u64) -> Result<EntryStream>;
}

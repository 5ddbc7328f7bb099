//! # pixel-indexer
//!
//! Indexes a pixel canvas contract's placement events:
//! - Parallel backfill of history from the contract's deployment block
//! - Live tail over a push subscription, with polling fallback
//! - Last-write-wins record cache keyed by coordinate
//! - Debounced, atomic snapshots for restart without rescanning
//! - Fan-out of every committed write to SSE subscribers
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//!            │    Ledger    │  eth_getLogs / eth_subscribe
//!            └──┬────────┬──┘
//!     backfill  │        │  live tail
//!   (chunks, ∥) │        │  (watch + poll)
//!            ┌──▼────────▼──┐      ┌──────────────┐
//!            │ Record cache │─────▶│  Publisher   │──▶ /events (SSE)
//!            │  (LWW put)   │      └──────────────┘
//!            └──┬────────┬──┘
//!   snapshot    │        │  query façade
//!            ┌──▼───┐  ┌─▼────────────────────────┐
//!            │ file │  │ /pixels /region /stats … │
//!            └──────┘  └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! pixel-indexer serve \
//!   --rpc-url https://rpc.example.org \
//!   --ws-url wss://rpc.example.org/ws \
//!   --contract 0x... --topic 0x... \
//!   --origin 1234567
//!
//! # Inspect a snapshot file offline
//! pixel-indexer inspect ./indexer-data/pixels.snap
//! ```

#![allow(clippy::result_large_err)]

pub mod api;
pub mod common;
pub mod indexer;
pub mod ledger;
pub mod server;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use indexer::{Pipeline, PipelineHandle, QueryService};
pub use ledger::{Ledger, LedgerEntry, MemoryLedger, RpcLedger};
pub use server::IndexerServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

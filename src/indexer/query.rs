//! Query façade
//!
//! Read-only view over the cache and sync state used by the HTTP API.

use super::cache::{Cell, RecordCache};
use super::checkpoint::CheckpointStore;
use super::fanout::{Publisher, Subscription};
use super::record::Record;
use super::status::{Gap, LiveMode, SyncStatus};
use crate::common::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::sync::Arc;

pub const MAX_PAGE_LIMIT: i64 = 100_000;
pub const MAX_PAGE_OFFSET: i64 = 10_000_000;

/// `x, y, color` as little-endian u32s
pub const BINARY_RECORD_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct IndexerStats {
    pub total_records: usize,
    pub last_processed_position: u64,
    pub head_position: u64,
    pub is_live_tail_active: bool,
    pub live_tail_mode: LiveMode,
    pub is_backfill_in_progress: bool,
    pub backfill_progress_ratio: f64,
    pub sync_incomplete: bool,
    pub sync_gaps: Vec<Gap>,
    pub subscribers: usize,
    pub resolution: u32,
    pub last_snapshot_at: Option<String>,
    pub version: u64,
}

/// Concatenated binary encoding of `records`
pub fn encode_binary(records: &[Record]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.len() * BINARY_RECORD_LEN);
    for r in records {
        buf.put_u32_le(r.x);
        buf.put_u32_le(r.y);
        buf.put_u32_le(r.color);
    }
    buf.freeze()
}

#[derive(Clone)]
pub struct QueryService {
    cache: Arc<RecordCache>,
    checkpoint: Arc<CheckpointStore>,
    status: Arc<SyncStatus>,
    publisher: Arc<Publisher>,
}

impl QueryService {
    pub fn new(
        cache: Arc<RecordCache>,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            cache,
            checkpoint,
            status,
            publisher,
        }
    }

    pub fn get(&self, x: u64, y: u64) -> Result<Option<Record>> {
        self.cache.get(x, y)
    }

    pub fn range(&self, x: u64, y: u64, width: u64, height: u64) -> Result<Vec<Cell>> {
        self.cache.range(x, y, width, height)
    }

    pub fn all(&self) -> Vec<Record> {
        self.cache.all()
    }

    pub fn paginate(&self, offset: i64, limit: i64) -> Result<Vec<Record>> {
        if !(0..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(Error::InvalidRequest(format!(
                "limit must be between 0 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        if !(0..=MAX_PAGE_OFFSET).contains(&offset) {
            return Err(Error::InvalidRequest(format!(
                "offset must be between 0 and {}",
                MAX_PAGE_OFFSET
            )));
        }
        Ok(self.cache.paginate(offset as usize, limit as usize))
    }

    /// Full dump in the binary encoding, with its record count
    pub fn binary(&self) -> (Bytes, usize) {
        let records = self.cache.all();
        (encode_binary(&records), records.len())
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    pub fn stats(&self) -> IndexerStats {
        let sync_gaps = self.status.gaps();
        IndexerStats {
            total_records: self.cache.len(),
            last_processed_position: self.checkpoint.get(),
            head_position: self.status.head(),
            is_live_tail_active: self.status.is_live_tail_active(),
            live_tail_mode: self.status.live_mode(),
            is_backfill_in_progress: self.status.is_backfill_in_progress(),
            backfill_progress_ratio: self.status.backfill_progress(),
            sync_incomplete: !sync_gaps.is_empty(),
            sync_gaps,
            subscribers: self.publisher.subscriber_count(),
            resolution: self.cache.canvas().resolution(),
            last_snapshot_at: self.status.last_snapshot_at().map(|t| t.to_rfc3339()),
            version: self.cache.version(),
        }
    }
}

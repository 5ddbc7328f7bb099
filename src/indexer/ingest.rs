//! Shared apply path for backfill and live tail

use super::cache::{PutOutcome, RecordCache};
use super::record::normalize;
use super::snapshot::SnapshotScheduler;
use crate::common::METRICS;
use crate::ledger::LedgerEntry;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub stale: usize,
    pub malformed: usize,
    /// Highest position among the batch's well-formed entries
    pub max_position: Option<u64>,
}

impl BatchSummary {
    pub fn merge(&mut self, other: BatchSummary) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.malformed += other.malformed;
        self.max_position = self.max_position.max(other.max_position);
    }
}

/// Normalizes ledger entries and applies them to the cache
#[derive(Clone)]
pub struct Ingestor {
    cache: Arc<RecordCache>,
    scheduler: Arc<SnapshotScheduler>,
}

impl Ingestor {
    pub fn new(cache: Arc<RecordCache>, scheduler: Arc<SnapshotScheduler>) -> Self {
        Self { cache, scheduler }
    }

    pub fn apply(&self, entries: &[LedgerEntry]) -> BatchSummary {
        let canvas = self.cache.canvas();
        let mut summary = BatchSummary::default();

        for entry in entries {
            let record = match normalize(entry, &canvas) {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(position = ?entry.position, "Dropping entry: {}", e);
                    summary.malformed += 1;
                    continue;
                }
            };
            summary.max_position = summary.max_position.max(Some(record.stamp.position));

            match self.cache.put(record) {
                PutOutcome::Inserted | PutOutcome::Updated => summary.applied += 1,
                PutOutcome::Stale => summary.stale += 1,
            }
        }

        METRICS.entries_applied.add(summary.applied as u64);
        METRICS.entries_stale.add(summary.stale as u64);
        METRICS.entries_malformed.add(summary.malformed as u64);

        if summary.applied > 0 {
            self.scheduler.mark_dirty();
        }
        summary
    }
}

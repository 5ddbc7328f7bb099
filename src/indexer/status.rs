//! Shared sync status: backfill progress, completeness gaps, live tail mode

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Inclusive position range whose range query exhausted its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gap {
    pub from: u64,
    pub to: u64,
}

impl Gap {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveMode {
    Stopped,
    Polling,
    Watching,
}

impl LiveMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LiveMode::Polling,
            2 => LiveMode::Watching,
            _ => LiveMode::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LiveMode::Stopped => 0,
            LiveMode::Polling => 1,
            LiveMode::Watching => 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncStatus {
    backfill_running: AtomicBool,
    /// A backfill run reached the head uninterrupted
    history_complete: AtomicBool,
    chunks_total: AtomicU64,
    chunks_resolved: AtomicU64,
    gaps: Mutex<BTreeSet<Gap>>,
    head: AtomicU64,
    live_mode: AtomicU8,
    last_snapshot_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_backfill(&self, total_chunks: u64) {
        self.chunks_total.store(total_chunks, Ordering::SeqCst);
        self.chunks_resolved.store(0, Ordering::SeqCst);
        self.backfill_running.store(true, Ordering::SeqCst);
    }

    /// A chunk finished, successfully or as a gap
    pub fn chunk_resolved(&self) {
        self.chunks_resolved.fetch_add(1, Ordering::SeqCst);
    }

    /// `completed` is false when the run was cut short and history below its
    /// head may still be unscanned
    pub fn end_backfill(&self, completed: bool) {
        if completed {
            self.history_complete.store(true, Ordering::SeqCst);
        }
        self.backfill_running.store(false, Ordering::SeqCst);
    }

    pub fn is_backfill_in_progress(&self) -> bool {
        self.backfill_running.load(Ordering::SeqCst)
    }

    /// Everything up to the checkpoint has been scanned, so the checkpoint may
    /// follow the live tail
    pub fn is_history_complete(&self) -> bool {
        self.history_complete.load(Ordering::SeqCst) && !self.is_backfill_in_progress()
    }

    /// Resolved / total chunks of the current run; 1.0 when idle
    pub fn backfill_progress(&self) -> f64 {
        if !self.is_backfill_in_progress() {
            return 1.0;
        }
        let total = self.chunks_total.load(Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let resolved = self.chunks_resolved.load(Ordering::SeqCst).min(total);
        resolved as f64 / total as f64
    }

    pub fn record_gap(&self, gap: Gap) {
        self.gaps.lock().unwrap_or_else(|e| e.into_inner()).insert(gap);
    }

    /// Returns true if the gap was recorded
    pub fn clear_gap(&self, gap: &Gap) -> bool {
        self.gaps.lock().unwrap_or_else(|e| e.into_inner()).remove(gap)
    }

    pub fn gaps(&self) -> Vec<Gap> {
        self.gaps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn restore_gaps(&self, gaps: impl IntoIterator<Item = Gap>) {
        self.gaps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(gaps);
    }

    pub fn is_sync_incomplete(&self) -> bool {
        !self.gaps.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Latest head seen; never goes backwards
    pub fn observe_head(&self, head: u64) {
        self.head.fetch_max(head, Ordering::SeqCst);
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_live_mode(&self, mode: LiveMode) {
        self.live_mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    pub fn live_mode(&self) -> LiveMode {
        LiveMode::from_u8(self.live_mode.load(Ordering::SeqCst))
    }

    pub fn is_live_tail_active(&self) -> bool {
        self.live_mode() != LiveMode::Stopped
    }

    pub fn mark_snapshot(&self, at: DateTime<Utc>) {
        *self
            .last_snapshot_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(at);
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_snapshot_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

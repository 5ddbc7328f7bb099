//! In-memory ledger
//!
//! Holds entries in a `Vec`, hands out broadcast-backed watch streams and can
//! inject failures. Used by the test suites and for local runs without a node.

use super::{EntryStream, Ledger, LedgerEntry};
use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<LedgerEntry>,
    head: u64,
    /// Remaining range queries to fail regardless of range
    fail_next: u32,
    /// Inclusive ranges whose queries always fail
    failing_ranges: Vec<(u64, u64)>,
}

pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    watchers: Mutex<broadcast::Sender<LedgerEntry>>,
    watch_enabled: AtomicBool,
    range_queries: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            watchers: Mutex::new(tx),
            watch_enabled: AtomicBool::new(true),
            range_queries: AtomicU64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry, raising the head to its position and notifying watchers
    pub fn push(&self, entry: LedgerEntry) {
        {
            let mut state = self.state();
            if let Some(position) = entry.position {
                state.head = state.head.max(position);
            }
            state.entries.push(entry.clone());
        }
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        let _ = watchers.send(entry);
    }

    /// Append a placement by a fixed test account
    pub fn place(&self, x: u64, y: u64, color: u64, position: u64) {
        self.place_at(x, y, color, position, 0);
    }

    pub fn place_at(&self, x: u64, y: u64, color: u64, position: u64, log_index: u64) {
        self.push(LedgerEntry::placement(
            "0x00000000000000000000000000000000000000aa",
            x,
            y,
            color,
            1_700_000_000 + position,
            position,
            log_index,
        ));
    }

    /// Advance the head without emitting entries (empty blocks)
    pub fn set_head(&self, head: u64) {
        let mut state = self.state();
        state.head = state.head.max(head);
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    pub fn set_watch_enabled(&self, enabled: bool) {
        self.watch_enabled.store(enabled, Ordering::SeqCst);
    }

    /// End every open watch stream, as a dropped transport would
    pub fn break_watchers(&self) {
        let (tx, _rx) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        *self.watchers.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    /// Fail the next `n` range queries with a rate-limit error
    pub fn fail_next_queries(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Fail every query overlapping `[from, to]` until `clear_faults`
    pub fn fail_range(&self, from: u64, to: u64) {
        self.state().failing_ranges.push((from, to));
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.fail_next = 0;
        state.failing_ranges.clear();
    }

    /// Number of `query_range` calls served or failed so far
    pub fn range_queries(&self) -> u64 {
        self.range_queries.load(Ordering::SeqCst)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn current_head(&self) -> Result<u64> {
        Ok(self.head())
    }

    async fn query_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        self.range_queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::RateLimited(format!(
                "injected failure for [{}, {}]",
                from, to
            )));
        }
        if state
            .failing_ranges
            .iter()
            .any(|&(lo, hi)| lo <= to && from <= hi)
        {
            return Err(Error::Timeout(format!("injected timeout for [{}, {}]", from, to)));
        }

        Ok(state
            .entries
            .iter()
            .filter(|e| e.position.is_some_and(|p| p >= from && p <= to))
            .cloned()
            .collect())
    }

    async fn watch(&self, from: u64) -> Result<EntryStream> {
        if !self.watch_enabled.load(Ordering::SeqCst) {
            return Err(Error::WatchUnavailable("watch disabled".into()));
        }
        let rx = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribe();

        let stream = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(entry) if entry.position.is_some_and(|p| p < from) => None,
                Ok(entry) => Some(Ok(entry)),
                Err(lagged) => Some(Err(Error::WatchUnavailable(lagged.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_range_is_inclusive() {
        let ledger = MemoryLedger::new();
        ledger.place(1, 1, 0xff, 10);
        ledger.place(2, 2, 0xff, 11);
        ledger.place(3, 3, 0xff, 12);

        let entries = ledger.query_range(10, 11).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(ledger.current_head().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = MemoryLedger::new();
        ledger.place(1, 1, 0xff, 10);

        ledger.fail_next_queries(1);
        assert!(matches!(
            ledger.query_range(0, 20).await,
            Err(Error::RateLimited(_))
        ));
        assert_eq!(ledger.query_range(0, 20).await.unwrap().len(), 1);

        ledger.fail_range(5, 9);
        assert!(ledger.query_range(0, 5).await.is_err());
        assert!(ledger.query_range(10, 20).await.is_ok());
        ledger.clear_faults();
        assert!(ledger.query_range(0, 5).await.is_ok());
        assert_eq!(ledger.range_queries(), 5);
    }

    #[tokio::test]
    async fn test_watch_streams_new_entries() {
        let ledger = MemoryLedger::new();
        ledger.place(1, 1, 0xff, 5);

        let mut stream = ledger.watch(6).await.unwrap();
        ledger.place(2, 2, 0xaa, 4); // before `from`, filtered
        ledger.place(3, 3, 0xbb, 6);

        let entry = stream.next().await.unwrap().unwrap();
        assert_eq!(entry.x, Some(3));

        ledger.break_watchers();
        assert!(stream.next().await.is_none());

        ledger.set_watch_enabled(false);
        assert!(matches!(
            ledger.watch(0).await,
            Err(Error::WatchUnavailable(_))
        ));
    }
}

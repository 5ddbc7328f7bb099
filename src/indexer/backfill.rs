//! Backfill scanner
//!
//! Walks `(checkpoint, head]` in fixed-size chunks with bounded parallelism.
//! Chunks that exhaust their retries become sync gaps; previously recorded gaps
//! are re-scanned at the start of every run.

use super::checkpoint::CheckpointStore;
use super::ingest::{BatchSummary, Ingestor};
use super::snapshot::SnapshotScheduler;
use super::status::{Gap, SyncStatus};
use crate::common::{retry_with_backoff, Backoff, Config, Error, Result, METRICS};
use crate::ledger::{Ledger, LedgerEntry};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Split the inclusive range `[from, to]` into chunks of at most `size` positions
pub fn chunks(from: u64, to: u64, size: u64) -> Vec<Gap> {
    let size = size.max(1);
    let mut out = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(size - 1).min(to);
        out.push(Gap::new(start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    out
}

/// One timed, time-bounded range query
pub(crate) async fn timed_query(
    ledger: &dyn Ledger,
    chunk: Gap,
    timeout: Duration,
) -> Result<Vec<LedgerEntry>> {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, ledger.query_range(chunk.from, chunk.to))
        .await
        .map_err(|_| Error::Timeout(format!("range [{}, {}]", chunk.from, chunk.to)))?;
    METRICS.range_query_latency.observe_duration(started.elapsed());
    result
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.indexer.chunk_size,
            concurrency: config.indexer.concurrency,
            max_retries: config.indexer.max_retries,
            retry_base_delay: config.indexer.retry_base_delay(),
            retry_max_delay: config.indexer.retry_max_delay(),
            request_timeout: config.ledger.request_timeout(),
        }
    }
}

enum ChunkOutcome {
    Done(BatchSummary),
    Failed(Error),
    /// Shutdown was signalled before the chunk started
    Skipped,
}

/// Outcome of one backfill run
#[derive(Debug, Default)]
pub struct BackfillReport {
    pub chunks: usize,
    pub repaired: usize,
    pub failed: Vec<Gap>,
    pub summary: BatchSummary,
    pub interrupted: bool,
}

pub struct BackfillScanner {
    ledger: Arc<dyn Ledger>,
    ingestor: Ingestor,
    checkpoint: Arc<CheckpointStore>,
    status: Arc<SyncStatus>,
    scheduler: Arc<SnapshotScheduler>,
    settings: ScanSettings,
}

impl BackfillScanner {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        ingestor: Ingestor,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        scheduler: Arc<SnapshotScheduler>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            ledger,
            ingestor,
            checkpoint,
            status,
            scheduler,
            settings,
        }
    }

    async fn scan_chunk(&self, chunk: Gap, mut shutdown: watch::Receiver<bool>) -> ChunkOutcome {
        if *shutdown.borrow() {
            return ChunkOutcome::Skipped;
        }

        let backoff = Backoff::new(self.settings.retry_base_delay, self.settings.retry_max_delay);
        let result = retry_with_backoff(
            || timed_query(self.ledger.as_ref(), chunk, self.settings.request_timeout),
            self.settings.max_retries,
            backoff,
            &mut shutdown,
        )
        .await;
        self.status.chunk_resolved();

        match result {
            Ok(entries) => {
                METRICS.chunks_completed.inc();
                ChunkOutcome::Done(self.ingestor.apply(&entries))
            }
            Err(e) => {
                METRICS.chunks_failed.inc();
                ChunkOutcome::Failed(e)
            }
        }
    }

    /// Re-scan recorded gaps, then scan `(checkpoint, head]`.
    ///
    /// The checkpoint moves to `head` only if the run was not interrupted by
    /// shutdown. Failed chunks are recorded as gaps either way.
    pub async fn run(&self, head: u64, shutdown: watch::Receiver<bool>) -> BackfillReport {
        let start = self.checkpoint.get();
        self.status.observe_head(head);

        let repairs = self.status.gaps();
        let mut work: Vec<(Gap, bool)> = repairs
            .iter()
            .flat_map(|gap| chunks(gap.from, gap.to, self.settings.chunk_size))
            .map(|chunk| (chunk, true))
            .collect();
        let repair_chunks = work.len();
        if head > start {
            work.extend(
                chunks(start + 1, head, self.settings.chunk_size)
                    .into_iter()
                    .map(|chunk| (chunk, false)),
            );
        }

        let mut report = BackfillReport {
            chunks: work.len(),
            ..Default::default()
        };
        self.status.begin_backfill(work.len() as u64);
        tracing::info!(
            from = start + 1,
            to = head,
            chunks = work.len(),
            gap_chunks = repair_chunks,
            concurrency = self.settings.concurrency,
            "Backfill started"
        );
        let started = Instant::now();

        let mut unresolved = Vec::new();
        let mut results = futures_util::stream::iter(work.into_iter().map(|(chunk, repair)| {
            let shutdown = shutdown.clone();
            async move { (chunk, repair, self.scan_chunk(chunk, shutdown).await) }
        }))
        .buffer_unordered(self.settings.concurrency.max(1));

        while let Some((chunk, repair, outcome)) = results.next().await {
            match outcome {
                ChunkOutcome::Done(summary) => {
                    report.summary.merge(summary);
                    if repair {
                        report.repaired += 1;
                    }
                }
                ChunkOutcome::Failed(e) => {
                    tracing::warn!(
                        from = chunk.from,
                        to = chunk.to,
                        "Chunk failed, recording sync gap: {}",
                        e
                    );
                    report.failed.push(chunk);
                    unresolved.push(chunk);
                }
                // untouched main-range chunks stay above the checkpoint, which
                // the live tail cannot move until a run completes
                ChunkOutcome::Skipped if repair => unresolved.push(chunk),
                ChunkOutcome::Skipped => {}
            }
        }
        drop(results);

        for gap in &repairs {
            self.status.clear_gap(gap);
        }
        for gap in unresolved {
            self.status.record_gap(gap);
        }
        if !repairs.is_empty() || !report.failed.is_empty() {
            self.scheduler.mark_dirty();
        }

        report.interrupted = *shutdown.borrow();
        if report.interrupted {
            tracing::info!(
                checkpoint = start,
                "Backfill interrupted by shutdown, checkpoint not advanced"
            );
        } else {
            if self.checkpoint.advance(head) {
                self.scheduler.mark_dirty();
            }
            self.scheduler.request_flush();
            tracing::info!(
                checkpoint = head,
                applied = report.summary.applied,
                stale = report.summary.stale,
                malformed = report.summary.malformed,
                repaired = report.repaired,
                gaps = report.failed.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Backfill complete"
            );
        }

        self.status.end_backfill(!report.interrupted);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::cache::{RecordCache, RegionLimits};
    use crate::indexer::record::Canvas;
    use crate::indexer::live::{LiveSettings, LiveTail};
    use crate::ledger::{EntryStream, MemoryLedger};
    use async_trait::async_trait;

    /// Range queries above `history_head` are live polls and take longer
    struct SlowLedger {
        inner: Arc<MemoryLedger>,
        history_head: u64,
    }

    #[async_trait]
    impl Ledger for SlowLedger {
        async fn current_head(&self) -> Result<u64> {
            self.inner.current_head().await
        }

        async fn query_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
            let delay = if from > self.history_head { 2 } else { 1 };
            tokio::time::sleep(Duration::from_secs(delay)).await;
            self.inner.query_range(from, to).await
        }

        async fn watch(&self, _from: u64) -> Result<EntryStream> {
            Err(Error::WatchUnavailable("polling only".into()))
        }
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        cache: Arc<RecordCache>,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        scanner: BackfillScanner,
    }

    fn harness(chunk_size: u64, start: u64) -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let cache = Arc::new(RecordCache::new(
            Canvas::new(1024),
            RegionLimits::default(),
            None,
        ));
        let scheduler = Arc::new(SnapshotScheduler::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
        ));
        let checkpoint = Arc::new(CheckpointStore::new(start));
        let status = Arc::new(SyncStatus::new());
        let scanner = BackfillScanner::new(
            ledger.clone(),
            Ingestor::new(cache.clone(), scheduler.clone()),
            checkpoint.clone(),
            status.clone(),
            scheduler,
            ScanSettings {
                chunk_size,
                concurrency: 5,
                max_retries: 3,
                retry_base_delay: Duration::from_millis(100),
                retry_max_delay: Duration::from_secs(1),
                request_timeout: Duration::from_secs(5),
            },
        );
        Harness {
            ledger,
            cache,
            checkpoint,
            status,
            scanner,
        }
    }

    #[test]
    fn test_chunks() {
        assert_eq!(
            chunks(1, 2500, 1000),
            vec![Gap::new(1, 1000), Gap::new(1001, 2000), Gap::new(2001, 2500)]
        );
        assert_eq!(chunks(5, 5, 1000), vec![Gap::new(5, 5)]);
        assert!(chunks(6, 5, 1000).is_empty());
        assert_eq!(chunks(u64::MAX - 1, u64::MAX, 10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_position_wins_across_chunks() {
        let h = harness(1, 0);
        h.ledger.place(0, 0, 0xff0000, 10);
        h.ledger.place(0, 0, 0x00ff00, 11);

        let (_tx, rx) = watch::channel(false);
        let report = h.scanner.run(11, rx).await;

        assert_eq!(report.chunks, 11);
        assert!(report.failed.is_empty());
        assert_eq!(h.cache.get(0, 0).unwrap().unwrap().color, 0x00ff00);
        assert_eq!(h.checkpoint.get(), 11);
        assert!(!h.status.is_backfill_in_progress());
        assert!(h.status.is_history_complete());
        assert_eq!(h.status.backfill_progress(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_becomes_gap_and_is_repaired() {
        let h = harness(2, 0);
        for p in 1..=10 {
            h.ledger.place(p as u64, 0, 0xff, p);
        }
        h.ledger.fail_range(3, 3);

        let (_tx, rx) = watch::channel(false);
        let report = h.scanner.run(10, rx.clone()).await;
        assert_eq!(report.failed, vec![Gap::new(3, 4)]);
        assert_eq!(h.checkpoint.get(), 10);
        assert!(h.status.is_sync_incomplete());
        assert!(h.cache.get(3, 0).unwrap().is_none());
        assert_eq!(h.cache.len(), 8);

        h.ledger.clear_faults();
        let report = h.scanner.run(10, rx).await;
        assert_eq!(report.repaired, 1);
        assert!(!h.status.is_sync_incomplete());
        assert_eq!(h.cache.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = harness(1000, 0);
        h.ledger.place(1, 1, 0xff, 5);
        h.ledger.fail_next_queries(2);

        let (_tx, rx) = watch::channel(false);
        let report = h.scanner.run(5, rx).await;
        assert!(report.failed.is_empty());
        assert_eq!(h.ledger.range_queries(), 3);
        assert!(h.cache.get(1, 1).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_checkpoint() {
        let h = harness(10, 100);
        h.ledger.place(1, 1, 0xff, 150);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = h.scanner.run(200, rx).await;

        assert!(report.interrupted);
        assert_eq!(h.checkpoint.get(), 100);
        assert!(report.failed.is_empty());
        assert!(!h.status.is_sync_incomplete());
        assert!(!h.status.is_history_complete());
        assert_eq!(h.ledger.range_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_poll_after_interrupted_run_keeps_checkpoint() {
        let memory = Arc::new(MemoryLedger::new());
        memory.place(1, 1, 0xff, 50);
        memory.set_head(200);
        let ledger: Arc<dyn Ledger> = Arc::new(SlowLedger {
            inner: memory,
            history_head: 100,
        });

        let cache = Arc::new(RecordCache::new(
            Canvas::new(1024),
            RegionLimits::default(),
            None,
        ));
        let scheduler = Arc::new(SnapshotScheduler::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
        ));
        let checkpoint = Arc::new(CheckpointStore::new(0));
        let status = Arc::new(SyncStatus::new());
        let ingestor = Ingestor::new(cache.clone(), scheduler.clone());

        let scanner = BackfillScanner::new(
            ledger.clone(),
            ingestor.clone(),
            checkpoint.clone(),
            status.clone(),
            scheduler.clone(),
            ScanSettings {
                chunk_size: 10,
                concurrency: 1,
                max_retries: 3,
                retry_base_delay: Duration::from_millis(100),
                retry_max_delay: Duration::from_secs(1),
                request_timeout: Duration::from_secs(5),
            },
        );
        let tail = LiveTail::new(
            ledger,
            ingestor,
            checkpoint.clone(),
            status.clone(),
            scheduler,
            LiveSettings {
                chunk_size: 100,
                poll_interval: Duration::from_millis(500),
                watch_poll_interval: Duration::from_secs(5),
                reconnect_base_delay: Duration::from_secs(1),
                reconnect_max_delay: Duration::from_secs(30),
                request_timeout: Duration::from_secs(10),
            },
            100,
        );

        status.begin_backfill(0);
        let (tx, rx) = watch::channel(false);
        let live = tokio::spawn(tail.run(rx.clone()));
        let backfill = tokio::spawn(async move { scanner.run(100, rx).await });

        // first history chunk and first live poll are both in flight
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        let report = backfill.await.unwrap();
        live.await.unwrap();

        assert!(report.interrupted);
        assert!(report.failed.is_empty());
        assert!(cache.get(1, 1).unwrap().is_none());
        // position 50 was never scanned, so the checkpoint must stay below it
        assert_eq!(checkpoint.get(), 0);
        assert!(!status.is_history_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_do() {
        let h = harness(10, 50);
        let (_tx, rx) = watch::channel(false);
        let report = h.scanner.run(50, rx).await;
        assert_eq!(report.chunks, 0);
        assert_eq!(h.checkpoint.get(), 50);
    }
}

//! Live tail watcher
//!
//! Follows the ledger past the backfill head. A push subscription is used when
//! the ledger offers one; polling keeps running underneath it at a slower rate
//! and takes over entirely while the subscription is down. Reconnects back off
//! exponentially.

use super::backfill::{chunks, timed_query};
use super::checkpoint::CheckpointStore;
use super::ingest::Ingestor;
use super::snapshot::SnapshotScheduler;
use super::status::{LiveMode, SyncStatus};
use crate::common::{shutdown_signalled, Backoff, Config, Error, Result, METRICS};
use crate::ledger::{EntryStream, Ledger, LedgerEntry};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub chunk_size: u64,
    pub poll_interval: Duration,
    pub watch_poll_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub request_timeout: Duration,
}

impl LiveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.indexer.chunk_size,
            poll_interval: config.indexer.poll_interval(),
            watch_poll_interval: config.indexer.watch_poll_interval(),
            reconnect_base_delay: config.indexer.reconnect_base_delay(),
            reconnect_max_delay: config.indexer.reconnect_max_delay(),
            request_timeout: config.ledger.request_timeout(),
        }
    }
}

async fn next_entry(watch: &mut Option<EntryStream>) -> Option<Result<LedgerEntry>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

pub struct LiveTail {
    ledger: Arc<dyn Ledger>,
    ingestor: Ingestor,
    checkpoint: Arc<CheckpointStore>,
    status: Arc<SyncStatus>,
    scheduler: Arc<SnapshotScheduler>,
    settings: LiveSettings,
    /// Every position up to here has been covered by a successful poll
    cursor: u64,
}

impl LiveTail {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        ingestor: Ingestor,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        scheduler: Arc<SnapshotScheduler>,
        settings: LiveSettings,
        cursor: u64,
    ) -> Self {
        Self {
            ledger,
            ingestor,
            checkpoint,
            status,
            scheduler,
            settings,
            cursor,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Query `(cursor, head]`. The cursor stops before the first failed chunk.
    async fn poll(&mut self) {
        METRICS.live_polls.inc();

        let head = match tokio::time::timeout(
            self.settings.request_timeout,
            self.ledger.current_head(),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                tracing::warn!("Live poll: head query failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::warn!("Live poll: head query timed out");
                return;
            }
        };
        self.status.observe_head(head);

        if head > self.cursor {
            for chunk in chunks(self.cursor + 1, head, self.settings.chunk_size) {
                match timed_query(self.ledger.as_ref(), chunk, self.settings.request_timeout).await
                {
                    Ok(entries) => {
                        let summary = self.ingestor.apply(&entries);
                        if summary.applied > 0 {
                            tracing::debug!(
                                from = chunk.from,
                                to = chunk.to,
                                applied = summary.applied,
                                "Live poll applied entries"
                            );
                        }
                        self.cursor = chunk.to;
                    }
                    Err(e) => {
                        tracing::warn!(
                            from = chunk.from,
                            to = chunk.to,
                            "Live poll failed, retrying next tick: {}",
                            e
                        );
                        break;
                    }
                }
            }
        }

        self.commit_cursor();
    }

    /// Checkpoint follows the cursor only once a backfill run has covered
    /// everything below it
    fn commit_cursor(&self) {
        if !self.status.is_history_complete() {
            return;
        }
        if self.checkpoint.advance(self.cursor) {
            self.scheduler.mark_dirty();
        }
    }

    async fn connect(&self) -> Result<EntryStream> {
        tokio::time::timeout(
            self.settings.request_timeout,
            self.ledger.watch(self.cursor + 1),
        )
        .await
        .map_err(|_| Error::Timeout("watch subscription".into()))?
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(cursor = self.cursor, "Live tail started");
        self.status.set_live_mode(LiveMode::Polling);

        let mut watch: Option<EntryStream> = None;
        let mut reconnect = Backoff::new(
            self.settings.reconnect_base_delay,
            self.settings.reconnect_max_delay,
        );
        let mut reconnect_at = Instant::now();
        let mut next_poll = Instant::now();
        let mut logged_unavailable = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown) => break,

                item = next_entry(&mut watch), if watch.is_some() => {
                    let reason = match item {
                        Some(Ok(entry)) => {
                            self.ingestor.apply(std::slice::from_ref(&entry));
                            continue;
                        }
                        Some(Err(e)) => e.to_string(),
                        None => "stream ended".to_string(),
                    };
                    let delay = reconnect.next_delay();
                    tracing::warn!(delay_ms = delay.as_millis() as u64, "Watch dropped ({}), polling until reconnect", reason);
                    METRICS.watch_reconnects.inc();
                    watch = None;
                    reconnect_at = Instant::now() + delay;
                    next_poll = Instant::now();
                    self.status.set_live_mode(LiveMode::Polling);
                }

                _ = sleep_until(reconnect_at), if watch.is_none() => {
                    match self.connect().await {
                        Ok(stream) => {
                            tracing::info!(from = self.cursor + 1, "Watch subscription connected");
                            watch = Some(stream);
                            reconnect.reset();
                            logged_unavailable = false;
                            self.status.set_live_mode(LiveMode::Watching);
                            // catch up on anything between the cursor and the subscription
                            next_poll = Instant::now();
                        }
                        Err(e) => {
                            let delay = reconnect.next_delay();
                            match e {
                                Error::WatchUnavailable(_) if logged_unavailable => {
                                    tracing::debug!("Watch unavailable: {}", e);
                                }
                                _ => {
                                    tracing::warn!(
                                        retry_in_ms = delay.as_millis() as u64,
                                        "Watch unavailable, polling: {}",
                                        e
                                    );
                                    logged_unavailable = true;
                                }
                            }
                            reconnect_at = Instant::now() + delay;
                        }
                    }
                }

                _ = sleep_until(next_poll) => {
                    self.poll().await;
                    let interval = if watch.is_some() {
                        self.settings.watch_poll_interval
                    } else {
                        self.settings.poll_interval
                    };
                    next_poll = Instant::now() + interval;
                }
            }
        }

        self.status.set_live_mode(LiveMode::Stopped);
        tracing::info!(cursor = self.cursor, "Live tail stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::cache::{RecordCache, RegionLimits};
    use crate::indexer::record::Canvas;
    use crate::ledger::MemoryLedger;

    struct Harness {
        ledger: Arc<MemoryLedger>,
        cache: Arc<RecordCache>,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        tail: LiveTail,
    }

    /// Live tail over a cursor whose history is already fully scanned
    fn harness(cursor: u64) -> Harness {
        let h = unscanned_harness(cursor);
        h.status.end_backfill(true);
        h
    }

    fn unscanned_harness(cursor: u64) -> Harness {
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
        let checkpoint = Arc::new(CheckpointStore::new(cursor));
        let status = Arc::new(SyncStatus::new());
        let tail = LiveTail::new(
            ledger.clone(),
            Ingestor::new(cache.clone(), scheduler.clone()),
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
            cursor,
        );
        Harness {
            ledger,
            cache,
            checkpoint,
            status,
            tail,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_fallback() {
        let h = harness(0);
        h.ledger.set_watch_enabled(false);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.tail.run(rx));

        h.ledger.place(1, 1, 0xff, 3);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.status.live_mode(), LiveMode::Polling);
        assert_eq!(h.cache.get(1, 1).unwrap().unwrap().color, 0xff);
        assert_eq!(h.checkpoint.get(), 3);

        h.ledger.set_head(250);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.checkpoint.get(), 250);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(h.status.live_mode(), LiveMode::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_applies_pushed_entries_and_reconnects() {
        let h = harness(10);
        h.ledger.set_head(10);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.tail.run(rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.status.live_mode(), LiveMode::Watching);

        h.ledger.place(7, 7, 0xabcdef, 11);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // pushed, well before the next safety poll
        assert_eq!(h.cache.get(7, 7).unwrap().unwrap().color, 0xabcdef);

        h.ledger.break_watchers();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.status.live_mode(), LiveMode::Polling);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.status.live_mode(), LiveMode::Watching);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_held_during_backfill() {
        let h = unscanned_harness(0);
        h.ledger.set_watch_enabled(false);
        h.status.begin_backfill(1);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.tail.run(rx));

        h.ledger.place(2, 2, 0xff, 40);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.cache.get(2, 2).unwrap().is_some());
        assert_eq!(h.checkpoint.get(), 0);

        h.status.end_backfill(true);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.checkpoint.get(), 40);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_backfill_holds_checkpoint() {
        let h = unscanned_harness(100);
        h.ledger.set_watch_enabled(false);
        h.ledger.place(3, 3, 0xff, 150);
        h.ledger.set_head(200);
        h.status.begin_backfill(10);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.tail.run(rx));

        // the run below the cursor stops without reaching its head
        h.status.end_backfill(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.cache.get(3, 3).unwrap().is_some());
        assert_eq!(h.checkpoint.get(), 100);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(h.checkpoint.get(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_does_not_advance() {
        let h = harness(0);
        h.ledger.set_watch_enabled(false);
        h.ledger.place(1, 1, 0xff, 50);
        h.ledger.place(2, 2, 0xff, 150);
        h.ledger.fail_range(120, 120);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.tail.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // [1, 100] succeeded, [101, 150] failed
        assert_eq!(h.checkpoint.get(), 100);
        assert!(h.cache.get(2, 2).unwrap().is_none());

        h.ledger.clear_faults();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.checkpoint.get(), 150);
        assert!(h.cache.get(2, 2).unwrap().is_some());

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}

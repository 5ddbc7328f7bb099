//! Pipeline orchestration
//!
//! Startup order: load the snapshot, fetch the ledger head, then spawn the
//! snapshot task, the backfill run and the live tail. Shutdown stops ingestion
//! first and lets the snapshot task write a final snapshot after it.

use super::backfill::{BackfillReport, BackfillScanner, ScanSettings};
use super::cache::{RecordCache, RegionLimits};
use super::checkpoint::CheckpointStore;
use super::fanout::Publisher;
use super::ingest::Ingestor;
use super::live::{LiveSettings, LiveTail};
use super::query::QueryService;
use super::record::Canvas;
use super::snapshot::{self, SnapshotScheduler, Snapshotter};
use super::status::SyncStatus;
use crate::common::{retry_with_backoff, Backoff, Config, Error, Result};
use crate::ledger::Ledger;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running pipeline
pub struct PipelineHandle {
    query: QueryService,
    shutdown_tx: watch::Sender<bool>,
    snapshot_shutdown_tx: watch::Sender<bool>,
    backfill: Option<JoinHandle<BackfillReport>>,
    live: JoinHandle<()>,
    snapshotter: JoinHandle<()>,
}

pub struct Pipeline;

impl Pipeline {
    /// Restore state and start ingesting. Fails if the snapshot is unreadable
    /// or the ledger head cannot be fetched.
    pub async fn start(config: &Config, ledger: Arc<dyn Ledger>) -> Result<PipelineHandle> {
        config.validate()?;

        let canvas = Canvas::new(config.indexer.resolution);
        let publisher = Publisher::new(config.api.subscriber_buffer);
        let cache = Arc::new(RecordCache::new(
            canvas,
            RegionLimits::from(&config.api),
            Some(publisher.clone()),
        ));
        let status = Arc::new(SyncStatus::new());
        let scheduler = Arc::new(SnapshotScheduler::new(
            config.indexer.quiet_period(),
            config.indexer.max_staleness(),
        ));

        let path = config.indexer.snapshot_path.clone();
        let restored = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || snapshot::load(&path, canvas))
                .await
                .map_err(|e| Error::Internal(format!("snapshot load panicked: {}", e)))??
        };
        let start = match restored {
            Some(state) => {
                let records = cache.restore(state.records);
                status.restore_gaps(state.gaps.iter().copied());
                tracing::info!(
                    path = %path.display(),
                    records,
                    checkpoint = state.checkpoint,
                    gaps = state.gaps.len(),
                    "Snapshot restored"
                );
                state.checkpoint
            }
            None => {
                let start = config.ledger.origin_position.saturating_sub(1);
                tracing::info!(path = %path.display(), checkpoint = start, "No snapshot, starting from origin");
                start
            }
        };
        let checkpoint = Arc::new(CheckpointStore::new(start));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshot_shutdown_tx, snapshot_shutdown_rx) = watch::channel(false);

        let head = {
            let mut rx = shutdown_rx.clone();
            let timeout = config.ledger.request_timeout();
            retry_with_backoff(
                || async {
                    tokio::time::timeout(timeout, ledger.current_head())
                        .await
                        .map_err(|_| Error::Timeout("head query".into()))?
                },
                config.indexer.max_retries,
                Backoff::new(
                    config.indexer.retry_base_delay(),
                    config.indexer.retry_max_delay(),
                ),
                &mut rx,
            )
            .await?
        };
        status.observe_head(head);
        tracing::info!(head, checkpoint = start, "Ledger head fetched");

        // reported as in progress before the scanner task gets scheduled
        status.begin_backfill(0);

        let ingestor = Ingestor::new(cache.clone(), scheduler.clone());

        let snapshotter = tokio::spawn(
            Snapshotter::new(
                path,
                cache.clone(),
                checkpoint.clone(),
                status.clone(),
                scheduler.clone(),
            )
            .run(snapshot_shutdown_rx),
        );

        let scanner = BackfillScanner::new(
            ledger.clone(),
            ingestor.clone(),
            checkpoint.clone(),
            status.clone(),
            scheduler.clone(),
            ScanSettings::from_config(config),
        );
        let backfill = {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { scanner.run(head, rx).await })
        };

        let tail = LiveTail::new(
            ledger,
            ingestor,
            checkpoint.clone(),
            status.clone(),
            scheduler,
            LiveSettings::from_config(config),
            head.max(start),
        );
        let live = tokio::spawn(tail.run(shutdown_rx));

        Ok(PipelineHandle {
            query: QueryService::new(cache, checkpoint, status, publisher),
            shutdown_tx,
            snapshot_shutdown_tx,
            backfill: Some(backfill),
            live,
            snapshotter,
        })
    }
}

impl PipelineHandle {
    pub fn query(&self) -> QueryService {
        self.query.clone()
    }

    /// Flips to `true` when shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for the startup backfill run. `None` if already awaited.
    pub async fn wait_backfill(&mut self) -> Option<BackfillReport> {
        let handle = self.backfill.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("Backfill task failed: {}", e);
                None
            }
        }
    }

    /// Stop ingestion, wait for it, then write the final snapshot
    pub async fn shutdown(mut self) {
        tracing::info!("Stopping pipeline");
        let _ = self.shutdown_tx.send(true);

        self.wait_backfill().await;
        if let Err(e) = self.live.await {
            tracing::error!("Live tail task failed: {}", e);
        }

        let _ = self.snapshot_shutdown_tx.send(true);
        if let Err(e) = self.snapshotter.await {
            tracing::error!("Snapshot task failed: {}", e);
        }
        tracing::info!("Pipeline stopped");
    }
}

//! Durability layer
//!
//! The cache, checkpoint and sync gaps are persisted together in one snapshot
//! file, rewritten atomically (`<path>.tmp`, fsync, rename). Writes are
//! debounced by [`SnapshotScheduler`]: a flush happens once mutations have been
//! quiet for `quiet_period`, or `max_staleness` after the first unsaved one.
//!
//! File layout (little-endian):
//! ```text
//! "PIXSNAP1" | checkpoint u64 | record_count u64
//! records: key u64, color u32, placed_at u64, position u64, log_index u32,
//!          placed_by_len u16, placed_by bytes
//! gap_count u32 | gaps: from u64, to u64
//! crc32 u32 (everything above)
//! ```

use super::cache::RecordCache;
use super::checkpoint::CheckpointStore;
use super::record::{Canvas, Record, Stamp};
use super::status::{Gap, SyncStatus};
use crate::common::{format_bytes, shutdown_signalled, Error, Result, METRICS};
use bytes::{Buf, BufMut};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

const SNAPSHOT_MAGIC: &[u8; 8] = b"PIXSNAP1";

/// Everything a restart needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotState {
    pub checkpoint: u64,
    pub records: Vec<Record>,
    pub gaps: Vec<Gap>,
}

pub fn encode(state: &SnapshotState, canvas: Canvas) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + state.records.len() * 48);
    buf.put_slice(SNAPSHOT_MAGIC);
    buf.put_u64_le(state.checkpoint);
    buf.put_u64_le(state.records.len() as u64);

    for record in &state.records {
        // ids longer than MAX_PLACER_ID_LEN are rejected by normalize
        let placed_by = record.placed_by.as_bytes();
        buf.put_u64_le(canvas.key(record.x, record.y));
        buf.put_u32_le(record.color);
        buf.put_u64_le(record.placed_at);
        buf.put_u64_le(record.stamp.position);
        buf.put_u32_le(record.stamp.log_index);
        buf.put_u16_le(placed_by.len() as u16);
        buf.put_slice(placed_by);
    }

    buf.put_u32_le(state.gaps.len() as u32);
    for gap in &state.gaps {
        buf.put_u64_le(gap.from);
        buf.put_u64_le(gap.to);
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Corrupted(format!("truncated {}", what)));
    }
    Ok(())
}

pub fn decode(data: &[u8], canvas: Canvas) -> Result<SnapshotState> {
    if data.len() < SNAPSHOT_MAGIC.len() + 8 + 8 + 4 + 4 {
        return Err(Error::Corrupted("snapshot too short".into()));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let mut buf = body;
    if &buf[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(Error::Corrupted("invalid snapshot magic".into()));
    }
    buf.advance(SNAPSHOT_MAGIC.len());

    let checkpoint = buf.get_u64_le();
    let count = buf.get_u64_le();

    let mut records = Vec::with_capacity(count.min(canvas.capacity()) as usize);
    for _ in 0..count {
        need(buf, 8 + 4 + 8 + 8 + 4 + 2, "record")?;
        let key = buf.get_u64_le();
        let color = buf.get_u32_le();
        let placed_at = buf.get_u64_le();
        let position = buf.get_u64_le();
        let log_index = buf.get_u32_le();
        let len = buf.get_u16_le() as usize;

        need(buf, len, "placer id")?;
        let placed_by = String::from_utf8(buf[..len].to_vec())
            .map_err(|_| Error::Corrupted("invalid UTF-8 in placer id".into()))?;
        buf.advance(len);

        if key >= canvas.capacity() {
            return Err(Error::Corrupted(format!(
                "key {} outside canvas of {}",
                key,
                canvas.resolution()
            )));
        }
        let (x, y) = canvas.coords(key);
        records.push(Record {
            x,
            y,
            color,
            placed_by,
            placed_at,
            stamp: Stamp::new(position, log_index),
        });
    }

    need(buf, 4, "gap count")?;
    let gap_count = buf.get_u32_le();
    let mut gaps = Vec::with_capacity(gap_count.min(1 << 16) as usize);
    for _ in 0..gap_count {
        need(buf, 16, "gap")?;
        gaps.push(Gap::new(buf.get_u64_le(), buf.get_u64_le()));
    }

    if buf.has_remaining() {
        return Err(Error::Corrupted(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }

    Ok(SnapshotState {
        checkpoint,
        records,
        gaps,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replace the snapshot at `path`. Returns the bytes written.
pub fn save(path: &Path, state: &SnapshotState, canvas: Canvas) -> Result<u64> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let data = encode(state, canvas);
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    // persist the rename itself
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(data.len() as u64)
}

/// Load the snapshot at `path`; `None` when there is none yet
pub fn load(path: &Path, canvas: Canvas) -> Result<Option<SnapshotState>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&data, canvas).map(Some)
}

#[derive(Debug, Default)]
struct DirtyState {
    first: Option<Instant>,
    last: Option<Instant>,
    force: bool,
}

/// Debounce state shared between the ingestion path and the snapshot task
pub struct SnapshotScheduler {
    state: Mutex<DirtyState>,
    notify: Notify,
    quiet_period: Duration,
    max_staleness: Duration,
}

impl SnapshotScheduler {
    pub fn new(quiet_period: Duration, max_staleness: Duration) -> Self {
        Self {
            state: Mutex::new(DirtyState::default()),
            notify: Notify::new(),
            quiet_period,
            max_staleness: max_staleness.max(quiet_period),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DirtyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Something worth persisting changed
    pub fn mark_dirty(&self) {
        let now = Instant::now();
        {
            let mut state = self.state();
            state.first.get_or_insert(now);
            state.last = Some(now);
        }
        self.notify.notify_one();
    }

    /// Flush at the next wake-up regardless of the quiet period
    pub fn request_flush(&self) {
        {
            let mut state = self.state();
            state.first.get_or_insert_with(Instant::now);
            state.force = true;
        }
        self.notify.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.state().first.is_some()
    }

    /// When the pending changes are due, if any
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state();
        let first = state.first?;
        if state.force {
            return Some(Instant::now());
        }
        let quiet = state.last.unwrap_or(first) + self.quiet_period;
        Some(quiet.min(first + self.max_staleness))
    }

    /// Clear the dirty state ahead of a flush. Returns false if it was clean.
    fn take_dirty(&self) -> bool {
        std::mem::take(&mut *self.state()).first.is_some()
    }
}

/// Snapshot task: owns all writes to the snapshot file
pub struct Snapshotter {
    path: PathBuf,
    cache: Arc<RecordCache>,
    checkpoint: Arc<CheckpointStore>,
    status: Arc<SyncStatus>,
    scheduler: Arc<SnapshotScheduler>,
}

impl Snapshotter {
    pub fn new(
        path: PathBuf,
        cache: Arc<RecordCache>,
        checkpoint: Arc<CheckpointStore>,
        status: Arc<SyncStatus>,
        scheduler: Arc<SnapshotScheduler>,
    ) -> Self {
        Self {
            path,
            cache,
            checkpoint,
            status,
            scheduler,
        }
    }

    /// Capture current state and write it out
    pub async fn flush(&self) -> Result<()> {
        let started = std::time::Instant::now();
        // checkpoint first: records captured later are at least as new
        let state = SnapshotState {
            checkpoint: self.checkpoint.get(),
            records: self.cache.snapshot_records(),
            gaps: self.status.gaps(),
        };
        let records = state.records.len();
        let checkpoint = state.checkpoint;

        let path = self.path.clone();
        let canvas = self.cache.canvas();
        let written = tokio::task::spawn_blocking(move || save(&path, &state, canvas))
            .await
            .map_err(|e| Error::Internal(format!("snapshot task panicked: {}", e)))??;

        METRICS.snapshots_written.inc();
        self.status.mark_snapshot(chrono::Utc::now());
        tracing::info!(
            records,
            checkpoint,
            size = %format_bytes(written),
            duration_ms = started.elapsed().as_millis() as u64,
            "Snapshot written"
        );
        Ok(())
    }

    async fn flush_pending(&self) {
        if !self.scheduler.take_dirty() {
            return;
        }
        if let Err(e) = self.flush().await {
            tracing::error!(path = %self.path.display(), "Snapshot write failed: {}", e);
            METRICS.snapshots_failed.inc();
            self.scheduler.mark_dirty();
        }
    }

    /// Flush whenever the scheduler says so; a final flush runs on shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = self.scheduler.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_pending().await;
                }
            }
        }

        self.flush_pending().await;
        tracing::info!("Snapshot task stopped");
    }
}

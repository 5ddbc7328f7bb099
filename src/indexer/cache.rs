//! Record cache
//!
//! Latest record per pixel in a `BTreeMap` keyed by `x + y * resolution`, so
//! full dumps and pagination come out in a stable order. The only mutation is
//! [`RecordCache::put`], a compare-and-apply on the write stamp.

use super::fanout::Publisher;
use super::record::{Canvas, Record};
use crate::common::{ApiConfig, Error, Result};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// Stored stamp is newer or equal; nothing changed
    Stale,
}

impl PutOutcome {
    pub fn is_committed(&self) -> bool {
        !matches!(self, PutOutcome::Stale)
    }
}

/// One coordinate of a region scan. Unwritten pixels have color 0 and no placer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub color: u32,
    pub placed_by: Option<String>,
    pub placed_at: Option<u64>,
}

impl Cell {
    fn empty(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            color: 0,
            placed_by: None,
            placed_at: None,
        }
    }
}

impl From<&Record> for Cell {
    fn from(r: &Record) -> Self {
        Self {
            x: r.x,
            y: r.y,
            color: r.color,
            placed_by: Some(r.placed_by.clone()),
            placed_at: Some(r.placed_at),
        }
    }
}

/// Bounds on a single region scan
#[derive(Debug, Clone, Copy)]
pub struct RegionLimits {
    pub max_area: u64,
    pub max_dimension: u32,
}

impl From<&ApiConfig> for RegionLimits {
    fn from(api: &ApiConfig) -> Self {
        Self {
            max_area: api.max_region_area,
            max_dimension: api.max_region_dimension,
        }
    }
}

impl Default for RegionLimits {
    fn default() -> Self {
        (&ApiConfig::default()).into()
    }
}

pub struct RecordCache {
    canvas: Canvas,
    limits: RegionLimits,
    records: RwLock<BTreeMap<u64, Record>>,
    version: AtomicU64,
    publisher: Option<Arc<Publisher>>,
}

impl RecordCache {
    pub fn new(canvas: Canvas, limits: RegionLimits, publisher: Option<Arc<Publisher>>) -> Self {
        Self {
            canvas,
            limits,
            records: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            publisher,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Record>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Record>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn canvas(&self) -> Canvas {
        self.canvas
    }

    pub fn limits(&self) -> RegionLimits {
        self.limits
    }

    /// Apply `record` if its stamp is newer than the stored one.
    ///
    /// Committed writes are published before the write guard is released, so
    /// subscribers see writes to one pixel in apply order.
    pub fn put(&self, record: Record) -> PutOutcome {
        let key = self.canvas.key(record.x, record.y);
        let mut records = self.write();

        let outcome = match records.entry(key) {
            Entry::Vacant(slot) => {
                if let Some(publisher) = &self.publisher {
                    publisher.publish(&record);
                }
                slot.insert(record);
                PutOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                if record.stamp <= slot.get().stamp {
                    return PutOutcome::Stale;
                }
                if let Some(publisher) = &self.publisher {
                    publisher.publish(&record);
                }
                slot.insert(record);
                PutOutcome::Updated
            }
        };

        self.version.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Record at `(x, y)`, `None` when never written
    pub fn get(&self, x: u64, y: u64) -> Result<Option<Record>> {
        let (x, y) = self.canvas.check(x, y)?;
        Ok(self.read().get(&self.canvas.key(x, y)).cloned())
    }

    /// Row-major scan of the rectangle at `(min_x, min_y)`; exactly
    /// `width * height` cells.
    pub fn range(&self, min_x: u64, min_y: u64, width: u64, height: u64) -> Result<Vec<Cell>> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidRequest(
                "width and height must be positive".into(),
            ));
        }
        let max_dim = self.limits.max_dimension as u64;
        if width > max_dim || height > max_dim {
            return Err(Error::InvalidRequest(format!(
                "width and height must be at most {}",
                max_dim
            )));
        }
        let area = width * height;
        if area > self.limits.max_area {
            return Err(Error::RegionTooLarge {
                area,
                max: self.limits.max_area,
            });
        }
        let (min_x, min_y) = self.canvas.check(min_x, min_y)?;
        self.canvas
            .check(min_x as u64 + width - 1, min_y as u64 + height - 1)?;

        let (width, height) = (width as u32, height as u32);
        let mut cells = Vec::with_capacity(area as usize);
        let records = self.read();

        for y in min_y..min_y + height {
            let start = self.canvas.key(min_x, y);
            let mut next_x = min_x;
            for (_, record) in records.range(start..start + width as u64) {
                cells.extend((next_x..record.x).map(|x| Cell::empty(x, y)));
                cells.push(Cell::from(record));
                next_x = record.x + 1;
            }
            cells.extend((next_x..min_x + width).map(|x| Cell::empty(x, y)));
        }

        Ok(cells)
    }

    /// Every record in key order
    pub fn all(&self) -> Vec<Record> {
        self.read().values().cloned().collect()
    }

    pub fn paginate(&self, offset: usize, limit: usize) -> Vec<Record> {
        self.read()
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Point-in-time copy for the durability layer
    pub fn snapshot_records(&self) -> Vec<Record> {
        self.all()
    }

    /// Load records from a snapshot without publishing them.
    /// Returns how many were applied.
    pub fn restore(&self, restored: Vec<Record>) -> usize {
        let mut records = self.write();
        let mut applied = 0;
        for record in restored {
            if !self.canvas.contains(record.x as u64, record.y as u64) {
                continue;
            }
            let key = self.canvas.key(record.x, record.y);
            match records.get(&key) {
                Some(existing) if existing.stamp >= record.stamp => {}
                _ => {
                    records.insert(key, record);
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            self.version.fetch_add(1, Ordering::Release);
        }
        applied
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Bumped on every committed write
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

//! Checkpoint store
//!
//! Last fully processed ledger position. Only ever moves forward; persisted as
//! part of the snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CheckpointStore {
    position: AtomicU64,
}

impl CheckpointStore {
    pub fn new(position: u64) -> Self {
        Self {
            position: AtomicU64::new(position),
        }
    }

    pub fn get(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Move the checkpoint to `position` if that is further along.
    /// Returns true when it moved.
    pub fn advance(&self, position: u64) -> bool {
        self.position.fetch_max(position, Ordering::AcqRel) < position
    }
}

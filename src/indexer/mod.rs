//! Ingestion pipeline: backfill + live tail into the record cache, with
//! snapshot persistence and fan-out to push subscribers.

pub mod backfill;
pub mod cache;
pub mod checkpoint;
pub mod fanout;
pub mod ingest;
pub mod live;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod snapshot;
pub mod status;

pub use backfill::{BackfillReport, BackfillScanner};
pub use cache::{Cell, PutOutcome, RecordCache, RegionLimits};
pub use checkpoint::CheckpointStore;
pub use fanout::{Publisher, Subscription};
pub use live::LiveTail;
pub use pipeline::{Pipeline, PipelineHandle};
pub use query::{IndexerStats, QueryService};
pub use record::{Canvas, Record, Stamp};
pub use status::{Gap, LiveMode, SyncStatus};

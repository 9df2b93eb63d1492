//! Worker-side orchestration: extraction, hardening, dedup and merge,
//! idempotent persistence, side-effect dispatch and the worker pool.

pub mod config;
pub mod dispatch;
pub mod extract;
pub mod harden;
pub mod heartbeat;
pub mod maintenance;
pub mod merge;
pub mod persist;
pub mod pipeline;
pub mod worker;

pub use config::PipelineConfig;
pub use dispatch::{render_message, DispatchOutcome, DispatchSettings, Dispatcher, SpoolReplaySummary};
pub use extract::{normalize_post_text, Extraction, Extractor};
pub use harden::{HardeningMode, HardeningSettings, Hardener, Violation};
pub use heartbeat::{check_heartbeat, heartbeat_path, write_heartbeat, Health, Heartbeat, HeartbeatReport};
pub use maintenance::{
    build_scheduler, EnqueueSummary, PromoteSummary, RecordDiff, SweepSummary, VersionComparison,
    INGESTER_COMPONENT,
};
pub use merge::{MatchedBy, MergeEngine, MergePolicy, Resolution};
pub use persist::{Persisted, PersistenceAdapter};
pub use pipeline::{Collaborators, Pipeline, Stores};
pub use worker::{run_job, PoolCounters, PoolSnapshot, WorkerPool, WorkerSettings, POOL_COMPONENT};

pub const CRATE_NAME: &str = "tap-pipeline";

//! Run orchestrator, step executor, asset ledger, and scheduler for
//! AppHub Catalog workflows.

mod assets;
mod bundles;
mod executor;
mod history;
mod orchestrator;
mod partition;
mod runkey;
mod scheduler;

pub use assets::{is_stale, next_cooldown_backoff, should_auto_materialize, AssetLedger, MaterializationInput};
pub use bundles::{verify_checksum, BundlePublisher, PublishRequest};
pub use executor::{
    evaluate_collection, AttemptOutcome, EnvServiceResolver, HeartbeatHandle, JobContext,
    JobHandler, JobHandlerRegistry, JobOutcome, ProducedAsset, ServiceEndpoint, ServiceResolver,
    StepExecutor,
};
pub use history::HistoryRecorder;
pub use orchestrator::{
    plan_run, CreateRunRequest, OrchestratorConfig, ReadyPlan, RunOrchestrator, TickOutcome,
    DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_RUN_CONCURRENCY,
};
pub use partition::{bucket_start, enumerate_lookback_keys, format_bucket, validate_partition_key, validate_time_window};
pub use runkey::normalize as normalize_run_key;
pub use scheduler::{catchup_windows, latest_window, matches_predicate, next_run_at, record_delivery_outcome, should_fire};

//! # Bar Rollup Pipeline
//!
//! Turns base-resolution (1m) OHLCV bars into coarser timeframes, one
//! task per (instrument, target timeframe), each walking a persisted
//! cursor forward window by window.
//!
//! ## Architecture
//!
//! **Key Principle:** every resolution has exactly one canonical table.
//!
//! - `data_bars` holds 1m bars only (ingested and synthetic)
//! - `derived_data_bars` holds everything coarser
//! - readers never union the two; a row in the wrong table fails the
//!   task hard
//!
//! A run (see `scheduler`) takes the job lease, recovers stale claims,
//! refreshes the DXY composite, then catches up due tasks in priority
//! order until its execution budget is spent. A coarser rollup never
//! reads past where its finer source task has got to.
//!
//! ## Schema Reference
//!
//! All types match SQL schema in `/sql/`:
//! - `data_bars` / `derived_data_bars` → `Bar` / `DerivedBar`
//! - `aggregation_tasks` → `AggregationTask`
//! - `job_locks` → `LeaseRecord`
//! - `aggregation_task_health` (view) → `TaskHealth`
//!
//! ## Module Organization
//!
//! - `types` - Core data structures
//! - `error` - Pipeline error taxonomy
//! - `config` - Environment configuration
//! - `db` - Bar Store and migrations
//! - `tasks` - Task Registry and state machine
//! - `bootstrap` - Initial cursor placement
//! - `windows` - Window Aggregator and quality policy
//! - `catchup` - Catch-up Driver
//! - `registry` - Instrument registry and task sync
//! - `lock` - Lease lock
//! - `orphan` - Orphan safeguard
//! - `composite` - Synthetic composite (DXY)
//! - `scheduler` - Orchestrator and periodic trigger

pub mod types;
pub mod error;
pub mod config;
pub mod db;
pub mod tasks;
pub mod bootstrap;
pub mod windows;
pub mod catchup;
pub mod registry;
pub mod lock;
pub mod orphan;
pub mod composite;
pub mod scheduler;

// Re-export commonly used types
pub use types::{AggregationTask, Bar, CatchupResult, DerivedBar, TaskStatus, Timeframe, WindowOutcome};
pub use error::PipelineError;
pub use config::AggregationConfig;
pub use registry::{InstrumentRegistry, SqliteRegistry};
pub use lock::LeaseLock;
pub use scheduler::{AggregationOrchestrator, PeriodicJob, RunOutcome, RunSummary};

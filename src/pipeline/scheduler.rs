//! Aggregation orchestrator and its periodic trigger
//!
//! One run:
//! 1. take the job lease (skip the whole run if someone else holds it)
//! 2. recover claims left `running` by an interrupted run
//! 3. refresh the synthetic composite (trailing lookback, or from where
//!    it left off after downtime)
//! 4. select due tasks and, for each while the execution budget lasts
//!    and the lease is still ours: heartbeat → orphan check → claim →
//!    catch-up → finish
//! 5. release the lease (on every exit path, via the guard)
//!
//! Tasks are processed one at a time. Per-task errors are recorded on the
//! task and never abort the batch.

use super::bootstrap::initial_cursor;
use super::catchup::{run_catchup, CatchupRequest};
use super::composite::{refresh_composite, CompositeReport, CompositeSpec, DXY};
use super::config::AggregationConfig;
use super::error::PipelineError;
use super::lock::LeaseLock;
use super::orphan::{check_task, OrphanCheck};
use super::registry::InstrumentRegistry;
use super::tasks::{claim_task, finish_task, get_due_tasks, recover_stale_claims, FinishPolicy};
use super::types::{AggregationTask, TaskOutcome, TaskStatus};
use async_trait::async_trait;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Aggregate counters for one completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub tasks_selected: usize,
    pub tasks_processed: usize,
    pub tasks_failed: usize,
    pub tasks_escalated: usize,
    pub tasks_orphaned: usize,
    pub windows_processed: u64,
    pub bars_created: u64,
    pub bars_low_quality: u64,
    pub bars_skipped: u64,
    pub stale_claims_recovered: usize,
    /// Stopped selecting tasks because the execution budget ran out
    pub budget_exhausted: bool,
    /// Stopped because the lease expired and another worker took it
    pub lease_lost: bool,
    pub composite: Option<CompositeReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Lease held elsewhere; nothing was touched
    Skipped { holder: Option<String> },
    Completed(RunSummary),
}

/// Work triggered on a fixed cadence
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run_once(&self, now: i64) -> Result<RunOutcome, PipelineError>;
}

pub struct AggregationOrchestrator {
    conn: Arc<Mutex<Connection>>,
    config: AggregationConfig,
    registry: Arc<dyn InstrumentRegistry>,
    lock: LeaseLock,
    composite: Option<CompositeSpec>,
}

impl AggregationOrchestrator {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: AggregationConfig,
        registry: Arc<dyn InstrumentRegistry>,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;

        let lock = LeaseLock::new(
            conn.clone(),
            config.job_name.clone(),
            config.worker_id.clone(),
            config.lock_lease_secs,
        );
        let composite = config.composite_enabled.then_some(DXY);

        Ok(Self {
            conn,
            config,
            registry,
            lock,
            composite,
        })
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// One full run at `now` (Unix seconds)
    pub fn run_blocking(&self, now: i64) -> Result<RunOutcome, PipelineError> {
        let Some(_lease) = self.lock.try_acquire(now)? else {
            let holder = self.lock.holder()?.map(|lease| lease.owner_id);
            log::info!(
                "⏸️  Skipping run: '{}' lease held by {}",
                self.config.job_name,
                holder.as_deref().unwrap_or("unknown")
            );
            return Ok(RunOutcome::Skipped { holder });
        };

        let summary = self.process_batch(now, Instant::now())?;

        log::info!(
            "✅ Run complete: {}/{} tasks, {} windows, {} bars ({} low quality, {} skipped), {} failed, {} orphaned{}",
            summary.tasks_processed,
            summary.tasks_selected,
            summary.windows_processed,
            summary.bars_created,
            summary.bars_low_quality,
            summary.bars_skipped,
            summary.tasks_failed,
            summary.tasks_orphaned,
            if summary.budget_exhausted { " (budget exhausted)" } else { "" }
        );
        Ok(RunOutcome::Completed(summary))
    }

    fn process_batch(&self, now: i64, started: Instant) -> Result<RunSummary, PipelineError> {
        let conn = self.conn.lock()?;
        let budget = Duration::from_millis(self.config.execution_budget_ms);
        let mut summary = RunSummary {
            stale_claims_recovered: recover_stale_claims(&conn, now)?,
            ..RunSummary::default()
        };

        if let Some(spec) = &self.composite {
            let refreshed = refresh_composite(
                &conn,
                spec,
                now,
                self.config.composite_lookback_secs,
                self.config.composite_max_span_secs,
            );
            match refreshed {
                Ok(report) => summary.composite = report,
                // Composite trouble must not block task processing
                Err(e) => log::warn!("⚠️  {} composite refresh failed: {}", spec.symbol, e),
            }
        }

        let due = get_due_tasks(&conn, now, self.config.task_batch_size)?;
        summary.tasks_selected = due.len();

        for task in &due {
            if started.elapsed() >= budget {
                summary.budget_exhausted = true;
                log::info!(
                    "⏱️  Execution budget of {}ms spent, {} tasks left for next run",
                    self.config.execution_budget_ms,
                    summary
                        .tasks_selected
                        .saturating_sub(summary.tasks_processed + summary.tasks_orphaned)
                );
                break;
            }

            let elapsed = i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX);
            if !self.lock.heartbeat_with(&conn, now.saturating_add(elapsed))? {
                summary.lease_lost = true;
                log::warn!(
                    "⚠️  Lease on '{}' no longer held by {}, stopping run",
                    self.config.job_name,
                    self.lock.owner_id()
                );
                break;
            }

            if let Err(e) = self.process_task(&conn, task, now, &mut summary) {
                // Task stays `running`; the next run's stale recovery frees it
                log::error!(
                    "❌ Could not record outcome for task {} ({} {}): {}",
                    task.id, task.symbol, task.target_timeframe, e
                );
                summary.tasks_failed += 1;
            }
        }

        Ok(summary)
    }

    fn process_task(
        &self,
        conn: &Connection,
        task: &AggregationTask,
        now: i64,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        if check_task(conn, self.registry.as_ref(), task, now) == OrphanCheck::Orphaned {
            summary.tasks_orphaned += 1;
            return Ok(());
        }

        if !claim_task(conn, task.id, now)? {
            log::debug!("⏭️  Task {} no longer claimable", task.id);
            return Ok(());
        }

        let request = CatchupRequest {
            max_windows: self.config.max_windows_per_task,
            now,
            ignore_confirmation_delay: false,
        };
        let result = match task.cursor {
            Some(cursor) => Ok(cursor),
            None => initial_cursor(task.min_start, task.run_interval_secs, now),
        }
        .and_then(|cursor| run_catchup(conn, task, cursor, request));

        let outcome = match result {
            Ok(result) => {
                summary.windows_processed += u64::from(result.windows_processed);
                summary.bars_created += u64::from(result.bars_created);
                summary.bars_low_quality += u64::from(result.bars_low_quality);
                summary.bars_skipped += u64::from(result.bars_skipped);
                TaskOutcome::Success(result)
            }
            Err(e) => {
                summary.tasks_failed += 1;
                TaskOutcome::Failure {
                    error: e.to_string(),
                    hard: e.is_hard(),
                }
            }
        };

        let finished = finish_task(conn, task.id, &outcome, &FinishPolicy::from(&self.config), now)?;
        if matches!(finished.status, TaskStatus::HardFailed | TaskStatus::Disabled) {
            summary.tasks_escalated += 1;
        }
        summary.tasks_processed += 1;
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for AggregationOrchestrator {
    fn name(&self) -> &str {
        &self.config.job_name
    }

    async fn run_once(&self, now: i64) -> Result<RunOutcome, PipelineError> {
        self.run_blocking(now)
    }
}

/// Run `job` every `interval_ms` until the task is cancelled
///
/// Errors are logged and the next tick runs normally.
pub async fn run_periodic(job: Arc<dyn PeriodicJob>, interval_ms: u64) {
    log::info!("⏰ Starting '{}' scheduler (interval: {}ms)", job.name(), interval_ms);

    let mut timer = interval(Duration::from_millis(interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        let now = chrono::Utc::now().timestamp();
        match job.run_once(now).await {
            Ok(RunOutcome::Completed(summary)) => {
                log::debug!("📈 '{}' run summary: {:?}", job.name(), summary);
            }
            Ok(RunOutcome::Skipped { .. }) => {}
            Err(e) => log::error!("❌ '{}' run failed: {}", job.name(), e),
        }
    }
}

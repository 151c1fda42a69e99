//! Task Registry: `aggregation_tasks` rows and their state machine
//!
//! Transitions (nothing else is permitted):
//! - `idle → running` on claim
//! - `running → idle` on success or recoverable failure
//! - `running → hard_failed` (mandatory) / `running → disabled` (optional)
//!   once the fail streak passes the threshold, or at once on a hard error
//!
//! `hard_failed`, `disabled` and `orphaned` only leave through `reset_task`.

use super::bootstrap::align_down;
use super::db::soft_delete_derived;
use super::error::PipelineError;
use super::types::{AggregationTask, FinishedTask, TaskHealth, TaskOutcome, TaskStatus, Timeframe};
use rusqlite::{params, Connection, OptionalExtension};

const TASK_COLUMNS: &str = "id, canonical_symbol, target_timeframe, source_timeframe, cursor_ts,
    run_interval_secs, confirmation_delay_secs, min_start_ts, status, enabled, mandatory,
    priority, fail_streak, last_error, last_success_at, next_due_at, notes";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggregationTask> {
    let target: String = row.get(2)?;
    let source: String = row.get(3)?;
    let status: String = row.get(8)?;

    Ok(AggregationTask {
        id: row.get(0)?,
        symbol: row.get(1)?,
        target_timeframe: target.parse().map_err(|e| conversion_error(2, e))?,
        source_timeframe: source.parse().map_err(|e| conversion_error(3, e))?,
        cursor: row.get(4)?,
        run_interval_secs: row.get(5)?,
        confirmation_delay_secs: row.get(6)?,
        min_start: row.get(7)?,
        status: status.parse().map_err(|e| conversion_error(8, e))?,
        enabled: row.get(9)?,
        mandatory: row.get(10)?,
        priority: row.get(11)?,
        fail_streak: row.get(12)?,
        last_error: row.get(13)?,
        last_success_at: row.get(14)?,
        next_due_at: row.get(15)?,
        notes: row.get(16)?,
    })
}

/// Definition of a task to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub symbol: String,
    pub target_timeframe: Timeframe,
    pub source_timeframe: Timeframe,
    pub run_interval_secs: i64,
    pub confirmation_delay_secs: i64,
    pub min_start: i64,
    pub mandatory: bool,
    pub priority: i64,
}

/// Settings `finish_task` needs to pick the next state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishPolicy {
    pub fail_streak_threshold: i64,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
}

impl From<&super::config::AggregationConfig> for FinishPolicy {
    fn from(config: &super::config::AggregationConfig) -> Self {
        Self {
            fail_streak_threshold: config.fail_streak_threshold,
            backoff_base_secs: config.backoff_base_secs,
            backoff_max_secs: config.backoff_max_secs,
        }
    }
}

/// Retry delay after the `fail_streak`-th consecutive failure
pub fn backoff_secs(fail_streak: i64, base: i64, max: i64) -> i64 {
    let exponent = (fail_streak - 1).clamp(0, 30) as u32;
    base.saturating_mul(2_i64.pow(exponent)).min(max)
}

pub fn insert_task(
    conn: &Connection,
    task: &NewTask,
    cursor: i64,
    now: i64,
) -> Result<i64, PipelineError> {
    conn.execute(
        r#"
        INSERT INTO aggregation_tasks (
            canonical_symbol, target_timeframe, source_timeframe, cursor_ts,
            run_interval_secs, confirmation_delay_secs, min_start_ts,
            status, enabled, mandatory, priority, next_due_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', 1, ?8, ?9, 0, ?10)
        "#,
        params![
            task.symbol,
            task.target_timeframe.as_str(),
            task.source_timeframe.as_str(),
            cursor,
            task.run_interval_secs,
            task.confirmation_delay_secs,
            task.min_start,
            task.mandatory,
            task.priority,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_task(conn: &Connection, task_id: i64) -> Result<Option<AggregationTask>, PipelineError> {
    let sql = format!("SELECT {} FROM aggregation_tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(conn.query_row(&sql, [task_id], task_from_row).optional()?)
}

pub fn find_task(
    conn: &Connection,
    symbol: &str,
    target: Timeframe,
) -> Result<Option<AggregationTask>, PipelineError> {
    let sql = format!(
        "SELECT {} FROM aggregation_tasks WHERE canonical_symbol = ?1 AND target_timeframe = ?2",
        TASK_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![symbol, target.as_str()], task_from_row)
        .optional()?)
}

/// Like `find_task`, but a missing definition is a configuration error
pub fn require_task(
    conn: &Connection,
    symbol: &str,
    target: Timeframe,
) -> Result<AggregationTask, PipelineError> {
    find_task(conn, symbol, target)?.ok_or_else(|| {
        PipelineError::Configuration(format!("no aggregation task for {} {}", symbol, target))
    })
}

pub fn list_tasks(conn: &Connection) -> Result<Vec<AggregationTask>, PipelineError> {
    let sql = format!(
        "SELECT {} FROM aggregation_tasks ORDER BY canonical_symbol, run_interval_secs",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// Due tasks in scheduling order
///
/// Mandatory first, then finer target timeframes (so coarser rollups see
/// fresh finer bars), then priority, then least recently succeeded.
pub fn get_due_tasks(
    conn: &Connection,
    now: i64,
    limit: u32,
) -> Result<Vec<AggregationTask>, PipelineError> {
    let sql = format!(
        "SELECT {} FROM aggregation_tasks
         WHERE enabled = 1 AND status = 'idle' AND next_due_at <= ?1
         ORDER BY mandatory DESC,
                  run_interval_secs ASC,
                  priority ASC,
                  last_success_at ASC NULLS FIRST,
                  id ASC
         LIMIT ?2",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params![now, limit], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// Claim an idle task: `idle → running`
///
/// Returns false when the task was not claimable (already running,
/// escalated, orphaned or disabled).
pub fn claim_task(conn: &Connection, task_id: i64, now: i64) -> Result<bool, PipelineError> {
    let changed = conn.execute(
        "UPDATE aggregation_tasks
         SET status = 'running', running_since = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'idle' AND enabled = 1",
        params![task_id, now],
    )?;
    Ok(changed == 1)
}

/// Return claims left in `running` by an interrupted run to `idle`
///
/// Only safe while holding the job lease: no other run can own them.
pub fn recover_stale_claims(conn: &Connection, now: i64) -> Result<usize, PipelineError> {
    let recovered = conn.execute(
        "UPDATE aggregation_tasks
         SET status = 'idle', running_since = NULL, updated_at = ?1,
             notes = 'claim recovered after interrupted run'
         WHERE status = 'running'",
        [now],
    )?;
    if recovered > 0 {
        log::warn!("♻️  Recovered {} stale task claims", recovered);
    }
    Ok(recovered)
}

/// Commit the outcome of a claimed task
pub fn finish_task(
    conn: &Connection,
    task_id: i64,
    outcome: &TaskOutcome,
    policy: &FinishPolicy,
    now: i64,
) -> Result<FinishedTask, PipelineError> {
    let tx = conn.unchecked_transaction()?;

    let task = get_task(&tx, task_id)?
        .ok_or_else(|| PipelineError::Configuration(format!("no aggregation task with id {}", task_id)))?;
    if task.status != TaskStatus::Running {
        return Err(PipelineError::Configuration(format!(
            "task {} is {}, not claimed",
            task_id, task.status
        )));
    }

    let finished = match outcome {
        TaskOutcome::Success(result) => {
            let previous = task.cursor.unwrap_or(i64::MIN);
            if result.new_cursor < previous {
                log::warn!(
                    "⚠️  {} {}: refusing to move cursor backwards ({} -> {})",
                    task.symbol, task.target_timeframe, previous, result.new_cursor
                );
            }
            let new_cursor = result.new_cursor.max(previous);
            let next_due_at = if result.exhausted_budget {
                now
            } else {
                now.max(new_cursor + task.run_interval_secs + task.confirmation_delay_secs)
            };

            tx.execute(
                "UPDATE aggregation_tasks
                 SET status = 'idle', cursor_ts = ?2, fail_streak = 0, last_error = NULL,
                     last_success_at = ?3, next_due_at = ?4, running_since = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![task_id, new_cursor, now, next_due_at],
            )?;

            FinishedTask {
                task_id,
                status: TaskStatus::Idle,
                fail_streak: 0,
                next_due_at,
            }
        }
        TaskOutcome::Failure { error, hard } => {
            let fail_streak = task.fail_streak + 1;
            let escalate = *hard || fail_streak > policy.fail_streak_threshold;

            if escalate {
                let status = if task.mandatory {
                    TaskStatus::HardFailed
                } else {
                    TaskStatus::Disabled
                };
                log::error!(
                    "🛑 {} {} escalated to {} after {} failures: {}",
                    task.symbol, task.target_timeframe, status, fail_streak, error
                );

                // Mandatory tasks stay enabled so the health view keeps them visible
                tx.execute(
                    "UPDATE aggregation_tasks
                     SET status = ?2, enabled = ?3, fail_streak = ?4, last_error = ?5,
                         running_since = NULL, updated_at = ?6
                     WHERE id = ?1",
                    params![task_id, status.as_str(), task.mandatory, fail_streak, error, now],
                )?;

                FinishedTask {
                    task_id,
                    status,
                    fail_streak,
                    next_due_at: task.next_due_at,
                }
            } else {
                let next_due_at =
                    now + backoff_secs(fail_streak, policy.backoff_base_secs, policy.backoff_max_secs);
                log::warn!(
                    "⚠️  {} {} failed ({}/{}), retry at {}: {}",
                    task.symbol,
                    task.target_timeframe,
                    fail_streak,
                    policy.fail_streak_threshold,
                    next_due_at,
                    error
                );

                tx.execute(
                    "UPDATE aggregation_tasks
                     SET status = 'idle', fail_streak = ?2, last_error = ?3, next_due_at = ?4,
                         running_since = NULL, updated_at = ?5
                     WHERE id = ?1",
                    params![task_id, fail_streak, error, next_due_at, now],
                )?;

                FinishedTask {
                    task_id,
                    status: TaskStatus::Idle,
                    fail_streak,
                    next_due_at,
                }
            }
        }
    };

    tx.commit()?;
    Ok(finished)
}

/// Manual recovery: clear the streak and return the task to `idle`
pub fn reset_task(conn: &Connection, task_id: i64, now: i64) -> Result<(), PipelineError> {
    let changed = conn.execute(
        "UPDATE aggregation_tasks
         SET status = 'idle', enabled = 1, fail_streak = 0, last_error = NULL,
             next_due_at = 0, running_since = NULL, updated_at = ?2,
             notes = 'manually reset'
         WHERE id = ?1",
        params![task_id, now],
    )?;
    if changed == 0 {
        return Err(PipelineError::Configuration(format!(
            "no aggregation task with id {}",
            task_id
        )));
    }
    log::info!("🔄 Task {} manually reset to idle", task_id);
    Ok(())
}

/// Operator regeneration: rebuild a task's bars from `from` onwards
///
/// Soft-deletes the task's derived bars at or after `from` (aligned down
/// to the run interval, never below the cursor floor) and moves the
/// cursor back there, so the following runs aggregate them again.
/// Refused while the task is running. Returns the number of bars
/// soft-deleted.
pub fn rewind_task(conn: &Connection, task_id: i64, from: i64, now: i64) -> Result<usize, PipelineError> {
    let tx = conn.unchecked_transaction()?;

    let task = get_task(&tx, task_id)?
        .ok_or_else(|| PipelineError::Configuration(format!("no aggregation task with id {}", task_id)))?;
    if task.status == TaskStatus::Running {
        return Err(PipelineError::Configuration(format!(
            "task {} is running; retry once the current run finishes",
            task_id
        )));
    }

    let cursor = align_down(from, task.run_interval_secs).max(task.cursor_floor());
    if task.cursor.map_or(true, |current| cursor >= current) {
        return Err(PipelineError::Configuration(format!(
            "task {} cursor {:?} is not past {}; nothing to regenerate",
            task_id, task.cursor, cursor
        )));
    }

    let deleted = soft_delete_derived(&tx, &task.symbol, task.target_timeframe, cursor, i64::MAX, now)?;
    tx.execute(
        "UPDATE aggregation_tasks
         SET cursor_ts = ?2, next_due_at = 0, updated_at = ?3,
             notes = 'rewound for regeneration'
         WHERE id = ?1",
        params![task_id, cursor, now],
    )?;
    tx.commit()?;

    log::info!(
        "⏪ {} {} rewound to {}: {} bars queued for regeneration",
        task.symbol, task.target_timeframe, cursor, deleted
    );
    Ok(deleted)
}

/// Read-only health rows, `hard_failed` first
pub fn task_health(conn: &Connection, now: i64) -> Result<Vec<TaskHealth>, PipelineError> {
    let sql = format!(
        "SELECT {} FROM aggregation_tasks
         ORDER BY CASE status WHEN 'hard_failed' THEN 0 WHEN 'disabled' THEN 1 ELSE 2 END,
                  fail_streak DESC, canonical_symbol, run_interval_secs",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|task| TaskHealth {
            task_id: task.id,
            cursor_lag_secs: task.cursor.map(|c| now - c),
            symbol: task.symbol,
            target_timeframe: task.target_timeframe,
            status: task.status,
            enabled: task.enabled,
            mandatory: task.mandatory,
            cursor: task.cursor,
            fail_streak: task.fail_streak,
            last_error: task.last_error,
            last_success_at: task.last_success_at,
        })
        .collect())
}

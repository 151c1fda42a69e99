//! Catch-up Driver: walk a task's cursor forward window by window
//!
//! Stop conditions, checked in order for each window:
//! 1. `max_windows` processed
//! 2. window not yet confirmed (`now < end + confirmation_delay`)
//! 3. derived source not rolled up through the window end yet
//! 4. window has zero source bars (data frontier)
//!
//! A task rolling up a derived timeframe (1h from 5m) only reads windows
//! its sibling source task has already passed. Otherwise a source task
//! stopped mid-window by its own window budget would hand over a partial
//! window that gets skipped and never revisited.
//!
//! Windows with some source bars but too few to store are skipped and the
//! cursor still advances past them.

use super::error::PipelineError;
use super::tasks::{find_task, require_task};
use super::types::{AggregationTask, CatchupResult, StopReason, Timeframe, WindowOutcome};
use super::windows::{aggregate_window, QualityPolicy};
use rusqlite::Connection;

/// Per-invocation limits for a catch-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupRequest {
    pub max_windows: u32,
    pub now: i64,
    /// Backfill mode: aggregate windows still inside their confirmation delay
    pub ignore_confirmation_delay: bool,
}

/// How far the source timeframe is complete for `task`
///
/// None for base-resolution sources, which have no upstream task. A
/// missing or never-bootstrapped source task means nothing is ready.
fn source_ready_until(conn: &Connection, task: &AggregationTask) -> Result<Option<i64>, PipelineError> {
    if task.source_timeframe.is_base() {
        return Ok(None);
    }
    let source_cursor = find_task(conn, &task.symbol, task.source_timeframe)?.and_then(|t| t.cursor);
    Ok(Some(source_cursor.unwrap_or(i64::MIN)))
}

/// Run catch-up for a loaded task starting at `start_cursor`
///
/// Never persists the cursor; the caller commits `new_cursor` through
/// `finish_task`. A failing window aborts the loop and leaves the stored
/// cursor where it was.
pub fn run_catchup(
    conn: &Connection,
    task: &AggregationTask,
    start_cursor: i64,
    request: CatchupRequest,
) -> Result<CatchupResult, PipelineError> {
    let interval = task.run_interval_secs;
    if interval <= 0 {
        return Err(PipelineError::Configuration(format!(
            "task {} has run interval {}",
            task.id, interval
        )));
    }

    let source_ready = source_ready_until(conn, task)?;
    let floor = task.cursor_floor();
    let mut cursor = start_cursor.max(floor);
    let mut result = CatchupResult {
        windows_processed: 0,
        new_cursor: cursor,
        bars_created: 0,
        bars_low_quality: 0,
        bars_skipped: 0,
        exhausted_budget: false,
        stop_reason: StopReason::WindowBudget,
    };

    loop {
        if result.windows_processed >= request.max_windows {
            result.exhausted_budget = true;
            result.stop_reason = StopReason::WindowBudget;
            break;
        }

        let window_start = cursor;
        let window_end = window_start + interval;

        // The floor window sits just before min_start; it is stepped over
        if window_start < task.min_start {
            cursor = window_end;
            continue;
        }

        if !request.ignore_confirmation_delay
            && request.now < window_end + task.confirmation_delay_secs
        {
            result.stop_reason = StopReason::AwaitingConfirmation;
            break;
        }

        if source_ready.is_some_and(|ready| window_end > ready) {
            result.stop_reason = StopReason::AwaitingSource;
            break;
        }

        let outcome = aggregate_window(
            conn,
            &task.symbol,
            task.source_timeframe,
            task.target_timeframe,
            window_start,
            window_end,
            request.now,
        )?;

        match outcome {
            WindowOutcome::SkippedFrontier => {
                result.stop_reason = StopReason::Frontier;
                break;
            }
            WindowOutcome::Stored { quality_score, .. } => {
                result.bars_created += 1;
                if quality_score < QualityPolicy::MAX_SCORE {
                    result.bars_low_quality += 1;
                }
            }
            WindowOutcome::SkippedLowQuality { .. } => {
                result.bars_skipped += 1;
            }
        }

        cursor = window_end;
        result.windows_processed += 1;
    }

    result.new_cursor = cursor;

    log::debug!(
        "📊 {} {}: {} windows ({} stored, {} low quality, {} skipped), cursor {} -> {}, stop {:?}",
        task.symbol,
        task.target_timeframe,
        result.windows_processed,
        result.bars_created,
        result.bars_low_quality,
        result.bars_skipped,
        start_cursor,
        result.new_cursor,
        result.stop_reason
    );

    Ok(result)
}

/// Catch up the (symbol, target) task from `start_cursor`
///
/// Fails with a configuration error when no such task is defined.
pub fn catchup_range(
    conn: &Connection,
    symbol: &str,
    target: Timeframe,
    start_cursor: i64,
    request: CatchupRequest,
) -> Result<CatchupResult, PipelineError> {
    let task = require_task(conn, symbol, target)?;
    run_catchup(conn, &task, start_cursor, request)
}

//! Cursor bootstrap for tasks that have never run
//!
//! The initial cursor depends only on time and `min_start`, never on
//! which bars happen to exist.

use super::error::PipelineError;
use super::tasks::require_task;
use super::types::Timeframe;
use rusqlite::{params, Connection};

/// Align `ts` down to a multiple of `interval` (epoch-aligned)
pub fn align_down(ts: i64, interval: i64) -> i64 {
    ts.div_euclid(interval) * interval
}

/// Initial cursor for a task: `max(min_start, now)` aligned down to the
/// run interval, never below `min_start - run_interval`
pub fn initial_cursor(min_start: i64, run_interval_secs: i64, now: i64) -> Result<i64, PipelineError> {
    if run_interval_secs <= 0 {
        return Err(PipelineError::Configuration(format!(
            "run interval must be positive, got {}",
            run_interval_secs
        )));
    }

    let aligned = align_down(min_start.max(now), run_interval_secs);
    Ok(aligned.max(min_start - run_interval_secs))
}

/// Cursor of the (symbol, target) task, initialising it on first use
///
/// An existing cursor is returned unchanged.
pub fn bootstrap_cursor(
    conn: &Connection,
    symbol: &str,
    target: Timeframe,
    now: i64,
) -> Result<i64, PipelineError> {
    let task = require_task(conn, symbol, target)?;
    if let Some(cursor) = task.cursor {
        return Ok(cursor);
    }

    let cursor = initial_cursor(task.min_start, task.run_interval_secs, now)?;
    conn.execute(
        "UPDATE aggregation_tasks SET cursor_ts = ?2, updated_at = ?3
         WHERE id = ?1 AND cursor_ts IS NULL",
        params![task.id, cursor, now],
    )?;

    log::info!("📍 Bootstrapped {} {} cursor at {}", symbol, target, cursor);
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::memory_db;
    use crate::pipeline::tasks::test_support::five_minute_task;
    use crate::pipeline::tasks::{get_task, insert_task};

    #[test]
    fn test_initial_cursor_aligns_now() {
        // 12:07:30 aligned to 5m -> 12:05:00
        assert_eq!(initial_cursor(0, 300, 43_650).unwrap(), 43_500);
        assert_eq!(initial_cursor(0, 3_600, 43_650).unwrap(), 43_200);
    }

    #[test]
    fn test_initial_cursor_respects_future_min_start() {
        // min_start 1000 not aligned: 900 is still >= floor 700
        assert_eq!(initial_cursor(1_000, 300, 10).unwrap(), 900);
        assert!(initial_cursor(0, 0, 10).is_err());
    }

    #[test]
    fn test_bootstrap_sets_cursor_once() {
        let conn = memory_db();
        let id = insert_task(&conn, &five_minute_task("EURUSD", true), 0, 0).unwrap();
        conn.execute("UPDATE aggregation_tasks SET cursor_ts = NULL WHERE id = ?1", [id])
            .unwrap();

        let first = bootstrap_cursor(&conn, "EURUSD", Timeframe::M5, 1_000).unwrap();
        assert_eq!(first, 900);
        assert_eq!(get_task(&conn, id).unwrap().unwrap().cursor, Some(900));

        // Later calls keep the persisted cursor
        assert_eq!(bootstrap_cursor(&conn, "EURUSD", Timeframe::M5, 99_000).unwrap(), 900);
    }

    #[test]
    fn test_bootstrap_missing_task() {
        let conn = memory_db();
        assert!(matches!(
            bootstrap_cursor(&conn, "EURUSD", Timeframe::H1, 0),
            Err(PipelineError::Configuration(_))
        ));
    }
}

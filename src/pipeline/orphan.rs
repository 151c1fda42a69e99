//! Orphan safeguard: state entries whose instrument left the registry
//!
//! Checked before a task or ingest state entry is processed. An orphaned
//! entry is annotated and parked instead of processed. The check never
//! fails its caller: when the registry cannot be consulted the entry is
//! processed as usual.

use super::error::PipelineError;
use super::registry::InstrumentRegistry;
use super::types::{AggregationTask, Timeframe};
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension};

pub const ORPHAN_NOTE_PREFIX: &str = "ORPHAN RECORD:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanCheck {
    /// Instrument is active; process normally
    Active,
    /// Instrument inactive; entry annotated and must be skipped
    Orphaned,
    /// Registry unavailable; process anyway
    Unverified,
}

impl OrphanCheck {
    pub fn should_process(&self) -> bool {
        !matches!(self, OrphanCheck::Orphaned)
    }
}

fn orphan_note(symbol: &str, now: i64) -> String {
    let date = DateTime::from_timestamp(now, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| now.to_string());
    format!(
        "{} {} not active in the instrument registry as of {}",
        ORPHAN_NOTE_PREFIX, symbol, date
    )
}

fn registry_verdict(registry: &dyn InstrumentRegistry, symbol: &str) -> OrphanCheck {
    match registry.is_active(symbol) {
        Ok(true) => OrphanCheck::Active,
        Ok(false) => OrphanCheck::Orphaned,
        Err(e) => {
            log::warn!("⚠️  Registry lookup for {} failed, proceeding: {}", symbol, e);
            OrphanCheck::Unverified
        }
    }
}

/// Park a task whose instrument left the registry
///
/// Shared by the run-time check and registry sync, so a deactivated
/// instrument always ends up `orphaned`. A task mid-run is left to its
/// run; returns whether the row changed.
pub fn mark_task_orphaned(
    conn: &Connection,
    task_id: i64,
    symbol: &str,
    now: i64,
) -> Result<bool, PipelineError> {
    let changed = conn.execute(
        "UPDATE aggregation_tasks
         SET status = 'orphaned', notes = ?2, updated_at = ?3
         WHERE id = ?1 AND status NOT IN ('running', 'orphaned')",
        params![task_id, orphan_note(symbol, now), now],
    )?;
    Ok(changed == 1)
}

/// Check an aggregation task before claiming it
pub fn check_task(
    conn: &Connection,
    registry: &dyn InstrumentRegistry,
    task: &AggregationTask,
    now: i64,
) -> OrphanCheck {
    let verdict = registry_verdict(registry, &task.symbol);
    if verdict != OrphanCheck::Orphaned {
        return verdict;
    }

    match mark_task_orphaned(conn, task.id, &task.symbol, now) {
        Ok(_) => log::warn!(
            "👻 ORPHANED_STATE task {} ({} {}) parked",
            task.id, task.symbol, task.target_timeframe
        ),
        // Still skipped this run; the next check retries the annotation
        Err(e) => log::error!("❌ Failed to mark task {} orphaned: {}", task.id, e),
    }
    OrphanCheck::Orphaned
}

/// Check an `ingest_state` entry before it is used
///
/// Registry sync runs this over every live entry. An instrument without
/// a state entry has nothing to orphan.
pub fn check_ingest_state(
    conn: &Connection,
    registry: &dyn InstrumentRegistry,
    symbol: &str,
    timeframe: Timeframe,
    now: i64,
) -> OrphanCheck {
    let exists = conn
        .query_row(
            "SELECT 1 FROM ingest_state WHERE canonical_symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe.as_str()],
            |_| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => {}
        Ok(None) => return OrphanCheck::Active,
        Err(e) => {
            log::warn!("⚠️  ingest_state lookup for {} {} failed, proceeding: {}", symbol, timeframe, e);
            return OrphanCheck::Unverified;
        }
    }

    let verdict = registry_verdict(registry, symbol);
    if verdict != OrphanCheck::Orphaned {
        return verdict;
    }

    let note = orphan_note(symbol, now);
    let marked = conn.execute(
        "UPDATE ingest_state SET status = 'orphaned', notes = ?3, updated_at = ?4
         WHERE canonical_symbol = ?1 AND timeframe = ?2",
        params![symbol, timeframe.as_str(), note, now],
    );
    match marked {
        Ok(_) => log::warn!("👻 ORPHANED_STATE ingest {} {} parked", symbol, timeframe),
        Err(e) => log::error!("❌ Failed to mark ingest {} {} orphaned: {}", symbol, timeframe, e),
    }
    OrphanCheck::Orphaned
}

//! Instrument registry access and task reconciliation
//!
//! Sync runs on its own, never inside an aggregation run: it creates the
//! missing (instrument, target timeframe) tasks and takes tasks whose
//! instrument is no longer active out of service. Those tasks are parked
//! with the orphan annotation, the same terminal state the run-time check
//! gives them, whichever of the two sees the deactivation first.

use super::bootstrap::initial_cursor;
use super::config::AggregationConfig;
use super::error::PipelineError;
use super::orphan::{check_ingest_state, mark_task_orphaned, OrphanCheck};
use super::tasks::{insert_task, list_tasks, NewTask};
use super::types::{AggregationTask, TaskStatus, Timeframe};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Registry row relevant to aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub symbol: String,
    pub mandatory: bool,
    pub priority: i64,
}

/// Source of truth for which instruments are active
pub trait InstrumentRegistry: Send + Sync {
    fn is_active(&self, symbol: &str) -> Result<bool, PipelineError>;

    fn active_instruments(&self) -> Result<Vec<RegistryEntry>, PipelineError>;
}

/// Registry backed by the `asset_registry` table
///
/// Holds its own connection so lookups never contend with the
/// orchestrator's connection mutex.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        Ok(Self::new(conn))
    }
}

impl InstrumentRegistry for SqliteRegistry {
    fn is_active(&self, symbol: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock()?;
        let active: Option<bool> = conn
            .query_row(
                "SELECT active = 1 OR test_active = 1 FROM asset_registry WHERE canonical_symbol = ?1",
                [symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(false))
    }

    fn active_instruments(&self) -> Result<Vec<RegistryEntry>, PipelineError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT canonical_symbol, mandatory, priority FROM asset_registry
             WHERE active = 1 OR test_active = 1
             ORDER BY canonical_symbol",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(RegistryEntry {
                    symbol: row.get(0)?,
                    mandatory: row.get(1)?,
                    priority: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

/// Insert or update a registry row
pub fn upsert_registry_entry(
    conn: &Connection,
    entry: &RegistryEntry,
    active: bool,
    now: i64,
) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO asset_registry (canonical_symbol, active, test_active, mandatory, priority, updated_at)
         VALUES (?1, ?2, 0, ?3, ?4, ?5)
         ON CONFLICT(canonical_symbol) DO UPDATE SET
             active = excluded.active,
             mandatory = excluded.mandatory,
             priority = excluded.priority,
             updated_at = excluded.updated_at",
        params![entry.symbol, active, entry.mandatory, entry.priority, now],
    )?;
    Ok(())
}

/// Defaults applied to tasks created by sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub target_timeframes: Vec<Timeframe>,
    pub default_min_start: i64,
    pub confirmation_delay_secs: i64,
}

impl From<&AggregationConfig> for SyncSettings {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            target_timeframes: config.target_timeframes.clone(),
            default_min_start: config.default_min_start,
            confirmation_delay_secs: config.confirmation_delay_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub create: Vec<NewTask>,
    /// (task id, symbol) of tasks to take out of service
    pub disable: Vec<(i64, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    /// Tasks parked as orphaned because their instrument went inactive
    pub disabled: usize,
    pub ingest_orphaned: usize,
}

/// Diff active instruments against existing tasks
///
/// Existing tasks are never recreated, whatever their status.
pub fn plan_task_sync(
    active: &[RegistryEntry],
    existing: &[AggregationTask],
    settings: &SyncSettings,
) -> SyncPlan {
    let have: HashSet<(&str, Timeframe)> = existing
        .iter()
        .map(|t| (t.symbol.as_str(), t.target_timeframe))
        .collect();
    let active_symbols: HashSet<&str> = active.iter().map(|e| e.symbol.as_str()).collect();

    let mut plan = SyncPlan::default();

    for entry in active {
        for &target in &settings.target_timeframes {
            let Some(source) = target.default_source() else {
                continue;
            };
            if have.contains(&(entry.symbol.as_str(), target)) {
                continue;
            }
            plan.create.push(NewTask {
                symbol: entry.symbol.clone(),
                target_timeframe: target,
                source_timeframe: source,
                run_interval_secs: target.seconds(),
                confirmation_delay_secs: settings.confirmation_delay_secs,
                min_start: settings.default_min_start,
                mandatory: entry.mandatory,
                priority: entry.priority,
            });
        }
    }

    for task in existing {
        if !active_symbols.contains(task.symbol.as_str()) && task.status != TaskStatus::Orphaned {
            plan.disable.push((task.id, task.symbol.clone()));
        }
    }

    plan
}

/// Apply a plan in one transaction; new tasks get a bootstrapped cursor
pub fn apply_task_sync(conn: &Connection, plan: &SyncPlan, now: i64) -> Result<SyncReport, PipelineError> {
    let tx = conn.unchecked_transaction()?;

    for task in &plan.create {
        let cursor = initial_cursor(task.min_start, task.run_interval_secs, now)?;
        insert_task(&tx, task, cursor, now)?;
        log::info!("➕ Created task {} {} (cursor {})", task.symbol, task.target_timeframe, cursor);
    }

    let mut disabled = 0;
    for (task_id, symbol) in &plan.disable {
        if mark_task_orphaned(&tx, *task_id, symbol, now)? {
            disabled += 1;
            log::info!("➖ Parked task {} ({} inactive)", task_id, symbol);
        }
    }

    tx.commit()?;

    Ok(SyncReport {
        created: plan.create.len(),
        disabled,
        ingest_orphaned: 0,
    })
}

/// Reconcile tasks with the registry's active instruments
pub fn sync_tasks_from_registry(
    conn: &Connection,
    registry: &dyn InstrumentRegistry,
    settings: &SyncSettings,
    now: i64,
) -> Result<SyncReport, PipelineError> {
    let active = registry.active_instruments()?;
    let existing = list_tasks(conn)?;
    let plan = plan_task_sync(&active, &existing, settings);
    let mut report = apply_task_sync(conn, &plan, now)?;
    report.ingest_orphaned = sweep_ingest_state(conn, registry, now)?;

    log::info!(
        "🔁 Registry sync: {} active instruments, {} tasks created, {} parked, {} ingest entries orphaned",
        active.len(),
        report.created,
        report.disabled,
        report.ingest_orphaned
    );
    Ok(report)
}

/// Run the orphan check over every live `ingest_state` entry
fn sweep_ingest_state(
    conn: &Connection,
    registry: &dyn InstrumentRegistry,
    now: i64,
) -> Result<usize, PipelineError> {
    let mut stmt = conn.prepare(
        "SELECT canonical_symbol, timeframe FROM ingest_state WHERE status != 'orphaned'",
    )?;
    let entries = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut orphaned = 0;
    for (symbol, timeframe) in entries {
        let Ok(timeframe) = timeframe.parse::<Timeframe>() else {
            log::warn!("⚠️  ingest_state {} has unknown timeframe '{}'", symbol, timeframe);
            continue;
        };
        if check_ingest_state(conn, registry, &symbol, timeframe, now) == OrphanCheck::Orphaned {
            orphaned += 1;
        }
    }
    Ok(orphaned)
}

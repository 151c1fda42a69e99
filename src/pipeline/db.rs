//! Bar Store: schema migrations and bar reads/upserts over SQLite
//!
//! Tables (see `/sql/`):
//! - `data_bars` - base resolution (1m) only
//! - `derived_data_bars` - every coarser resolution, soft-deletable
//!
//! Resolution-to-table mapping is fixed and exclusive: readers never union
//! the two tables.

use super::error::PipelineError;
use super::types::{Bar, DerivedBar, Timeframe};
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub const BASE_TABLE: &str = "data_bars";
pub const DERIVED_TABLE: &str = "derived_data_bars";

/// Ordered schema files; every statement uses IF NOT EXISTS
const MIGRATIONS: &[(&str, &str)] = &[
    ("01_asset_registry.sql", include_str!("../../sql/01_asset_registry.sql")),
    ("02_data_bars.sql", include_str!("../../sql/02_data_bars.sql")),
    ("03_derived_data_bars.sql", include_str!("../../sql/03_derived_data_bars.sql")),
    ("04_aggregation_tasks.sql", include_str!("../../sql/04_aggregation_tasks.sql")),
    ("05_ingest_state.sql", include_str!("../../sql/05_ingest_state.sql")),
    ("06_job_locks.sql", include_str!("../../sql/06_job_locks.sql")),
    ("07_task_health_view.sql", include_str!("../../sql/07_task_health_view.sql")),
];

/// Run schema migrations (idempotent)
pub fn run_schema_migrations(conn: &Connection) -> Result<(), PipelineError> {
    log::info!("🔧 Running {} schema migrations", MIGRATIONS.len());

    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Open (or create) the database, apply PRAGMAs and migrate
pub fn open_database(db_path: impl AsRef<Path>) -> Result<Connection, PipelineError> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn)?;
    run_schema_migrations(&conn)?;
    Ok(conn)
}

/// Canonical table holding a resolution
pub fn table_for(timeframe: Timeframe) -> &'static str {
    if timeframe.is_base() {
        BASE_TABLE
    } else {
        DERIVED_TABLE
    }
}

/// Count rows of `timeframe` sitting in the table that must NOT hold it
///
/// Any non-zero count inside an aggregation window is an architecture
/// violation and fails the task hard.
pub fn count_misplaced_rows(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    start: i64,
    end: i64,
) -> Result<i64, PipelineError> {
    let sql = if timeframe.is_base() {
        "SELECT COUNT(*) FROM derived_data_bars
         WHERE canonical_symbol = ?1 AND timeframe = ?2
           AND ts_utc >= ?3 AND ts_utc < ?4
           AND deleted_at IS NULL"
    } else {
        "SELECT COUNT(*) FROM data_bars
         WHERE canonical_symbol = ?1 AND timeframe = ?2
           AND ts_utc >= ?3 AND ts_utc < ?4"
    };

    let count = conn.query_row(
        sql,
        params![symbol, timeframe.as_str(), start, end],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn bar_from_row(row: &rusqlite::Row<'_>, timeframe: Timeframe) -> rusqlite::Result<Bar> {
    Ok(Bar {
        symbol: row.get(0)?,
        timeframe,
        ts_utc: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        vwap: row.get(7)?,
        trade_count: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
    })
}

/// Read every `timeframe` bar with `start <= ts_utc < end`, ordered by time
///
/// Reads only from the canonical table for the resolution.
pub fn read_bars_in_window(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    start: i64,
    end: i64,
) -> Result<Vec<Bar>, PipelineError> {
    let sql = if timeframe.is_base() {
        "SELECT canonical_symbol, ts_utc, open, high, low, close, vol, vwap, trade_count
         FROM data_bars
         WHERE canonical_symbol = ?1 AND timeframe = ?2
           AND ts_utc >= ?3 AND ts_utc < ?4
         ORDER BY ts_utc ASC"
    } else {
        "SELECT canonical_symbol, ts_utc, open, high, low, close, vol, vwap, trade_count
         FROM derived_data_bars
         WHERE canonical_symbol = ?1 AND timeframe = ?2
           AND ts_utc >= ?3 AND ts_utc < ?4
           AND deleted_at IS NULL
         ORDER BY ts_utc ASC"
    };

    let mut stmt = conn.prepare(sql)?;
    let bars = stmt
        .query_map(params![symbol, timeframe.as_str(), start, end], |row| {
            bar_from_row(row, timeframe)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bars)
}

/// Upsert a base resolution bar into `data_bars`
///
/// Returns true when a new row was inserted, false when an existing row
/// was overwritten.
pub fn upsert_base_bar(
    conn: &Connection,
    bar: &Bar,
    source: &str,
    raw: Option<&str>,
    now: i64,
) -> Result<bool, PipelineError> {
    if !bar.timeframe.is_base() {
        return Err(PipelineError::ArchitectureViolation(format!(
            "{} bars cannot be written to {}",
            bar.timeframe, BASE_TABLE
        )));
    }

    let existed = conn
        .query_row(
            "SELECT 1 FROM data_bars WHERE canonical_symbol = ?1 AND timeframe = ?2 AND ts_utc = ?3",
            params![bar.symbol, bar.timeframe.as_str(), bar.ts_utc],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    conn.execute(
        r#"
        INSERT INTO data_bars (
            canonical_symbol, timeframe, ts_utc, open, high, low, close,
            vol, vwap, trade_count, is_partial, source, ingested_at, raw
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13)
        ON CONFLICT(canonical_symbol, timeframe, ts_utc) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            vol = excluded.vol,
            vwap = excluded.vwap,
            trade_count = excluded.trade_count,
            source = excluded.source,
            ingested_at = excluded.ingested_at,
            raw = excluded.raw
        "#,
        params![
            bar.symbol,
            bar.timeframe.as_str(),
            bar.ts_utc,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.vwap,
            bar.trade_count,
            source,
            now,
            raw,
        ],
    )?;

    Ok(!existed)
}

/// Upsert an aggregated bar into `derived_data_bars`
///
/// Last-value semantics: re-aggregating a window overwrites every value
/// and clears any soft delete.
pub fn upsert_derived_bar(
    conn: &Connection,
    derived: &DerivedBar,
    now: i64,
) -> Result<(), PipelineError> {
    let bar = &derived.bar;
    if bar.timeframe.is_base() {
        return Err(PipelineError::ArchitectureViolation(format!(
            "{} bars cannot be written to {}",
            bar.timeframe, DERIVED_TABLE
        )));
    }

    conn.execute(
        r#"
        INSERT INTO derived_data_bars (
            canonical_symbol, timeframe, ts_utc, open, high, low, close,
            vol, vwap, trade_count, source_count, quality_score, source,
            derivation_version, deleted_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, ?15, ?15)
        ON CONFLICT(canonical_symbol, timeframe, ts_utc) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            vol = excluded.vol,
            vwap = excluded.vwap,
            trade_count = excluded.trade_count,
            source_count = excluded.source_count,
            quality_score = excluded.quality_score,
            source = excluded.source,
            derivation_version = excluded.derivation_version,
            deleted_at = NULL,
            updated_at = excluded.updated_at
        "#,
        params![
            bar.symbol,
            bar.timeframe.as_str(),
            bar.ts_utc,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.vwap,
            bar.trade_count,
            derived.source_count,
            derived.quality_score,
            derived.source,
            derived.derivation_version,
            now,
        ],
    )?;

    Ok(())
}

/// Fetch one live derived bar
pub fn get_derived_bar(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    ts_utc: i64,
) -> Result<Option<DerivedBar>, PipelineError> {
    let derived = conn
        .query_row(
            "SELECT canonical_symbol, ts_utc, open, high, low, close, vol, vwap, trade_count,
                    source_count, quality_score, source, derivation_version
             FROM derived_data_bars
             WHERE canonical_symbol = ?1 AND timeframe = ?2 AND ts_utc = ?3
               AND deleted_at IS NULL",
            params![symbol, timeframe.as_str(), ts_utc],
            |row| {
                Ok(DerivedBar {
                    bar: bar_from_row(row, timeframe)?,
                    source_count: row.get(9)?,
                    quality_score: row.get(10)?,
                    source: row.get(11)?,
                    derivation_version: row.get(12)?,
                })
            },
        )
        .optional()?;
    Ok(derived)
}

/// Soft-delete derived bars in `[from, to)` so they can be regenerated
pub fn soft_delete_derived(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    from: i64,
    to: i64,
    now: i64,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE derived_data_bars
         SET deleted_at = ?5, updated_at = ?5
         WHERE canonical_symbol = ?1 AND timeframe = ?2
           AND ts_utc >= ?3 AND ts_utc < ?4
           AND deleted_at IS NULL",
        params![symbol, timeframe.as_str(), from, to, now],
    )?;
    Ok(changed)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = memory_db();
        run_schema_migrations(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('data_bars', 'derived_data_bars', 'aggregation_tasks', 'job_locks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_base_upsert_reports_insert_then_update() {
        let conn = memory_db();
        let bar = minute_bar("EURUSD", 600, 1.1);

        assert!(upsert_base_bar(&conn, &bar, "massive", None, 700).unwrap());
        assert!(!upsert_base_bar(&conn, &bar, "massive", None, 800).unwrap());

        let rows = read_bars_in_window(&conn, "EURUSD", Timeframe::M1, 600, 660).unwrap();
        assert_eq!(rows, vec![bar]);
    }

    #[test]
    fn test_window_read_is_half_open() {
        let conn = memory_db();
        seed_minutes(&conn, "BTC", 0, 10);

        let rows = read_bars_in_window(&conn, "BTC", Timeframe::M1, 60, 300).unwrap();
        let ts: Vec<i64> = rows.iter().map(|b| b.ts_utc).collect();
        assert_eq!(ts, vec![60, 120, 180, 240]);
    }

    #[test]
    fn test_wrong_table_writes_rejected() {
        let conn = memory_db();
        let mut bar = minute_bar("BTC", 0, 1.0);
        bar.timeframe = Timeframe::M5;
        assert!(matches!(
            upsert_base_bar(&conn, &bar, "test", None, 0),
            Err(PipelineError::ArchitectureViolation(_))
        ));
    }

    #[test]
    fn test_soft_deleted_bars_hidden_and_restored_by_upsert() {
        let conn = memory_db();
        let mut bar = minute_bar("BTC", 300, 5.0);
        bar.timeframe = Timeframe::M5;
        let derived = DerivedBar {
            bar,
            source_count: 5,
            quality_score: 2,
            source: "aggregated".to_string(),
            derivation_version: 1,
        };
        upsert_derived_bar(&conn, &derived, 1_000).unwrap();

        assert_eq!(soft_delete_derived(&conn, "BTC", Timeframe::M5, 0, 600, 1_100).unwrap(), 1);
        assert!(get_derived_bar(&conn, "BTC", Timeframe::M5, 300).unwrap().is_none());

        upsert_derived_bar(&conn, &derived, 1_200).unwrap();
        assert_eq!(get_derived_bar(&conn, "BTC", Timeframe::M5, 300).unwrap(), Some(derived));
    }
}

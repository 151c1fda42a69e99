//! Synthetic composite instrument (DXY) at the base resolution
//!
//! For each minute where every component has a positive close, the
//! composite is `constant * Π close_i ^ weight_i`, written to `data_bars`
//! with O = H = L = C. The completeness check and the write share a
//! transaction, so a minute is never written from a partial component set.
//!
//! The producer keeps its progress in its own `ingest_state` row: each run
//! recomputes the trailing lookback, and after downtime resumes just past
//! the last minute it covered, so no stretch of the composite is left
//! unwritten for the aggregation tasks to stall on.

use super::bootstrap::align_down;
use super::db::upsert_base_bar;
use super::error::PipelineError;
use super::types::{Bar, Timeframe, SOURCE_SYNTHETIC};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeComponent {
    pub symbol: &'static str,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeSpec {
    pub symbol: &'static str,
    pub constant: f64,
    pub components: &'static [CompositeComponent],
    pub version: i64,
}

/// ICE US Dollar Index
pub const DXY: CompositeSpec = CompositeSpec {
    symbol: "DXY",
    constant: 50.143_481_12,
    components: &[
        CompositeComponent { symbol: "EURUSD", weight: -0.576 },
        CompositeComponent { symbol: "USDJPY", weight: 0.136 },
        CompositeComponent { symbol: "GBPUSD", weight: -0.119 },
        CompositeComponent { symbol: "USDCAD", weight: 0.091 },
        CompositeComponent { symbol: "USDSEK", weight: 0.042 },
        CompositeComponent { symbol: "USDCHF", weight: 0.036 },
    ],
    version: 1,
};

impl CompositeSpec {
    /// Composite value from closes in component order
    ///
    /// None unless every component is present and strictly positive.
    pub fn value(&self, closes: &[Option<f64>]) -> Option<f64> {
        if closes.len() != self.components.len() {
            return None;
        }

        let mut log_sum = self.constant.ln();
        for (component, close) in self.components.iter().zip(closes) {
            let close = (*close)?;
            if close.is_nan() || close <= 0.0 {
                return None;
            }
            log_sum += component.weight * close.ln();
        }

        let value = log_sum.exp();
        value.is_finite().then_some(value)
    }

    fn raw_payload(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string(&serde_json::json!({
            "kind": self.symbol.to_lowercase(),
            "version": self.version,
        }))?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompositeReport {
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
}

fn component_close(conn: &Connection, symbol: &str, ts_utc: i64) -> Result<Option<f64>, PipelineError> {
    let close = conn
        .query_row(
            "SELECT close FROM data_bars WHERE canonical_symbol = ?1 AND timeframe = ?2 AND ts_utc = ?3",
            params![symbol, Timeframe::M1.as_str(), ts_utc],
            |row| row.get(0),
        )
        .optional()?;
    Ok(close)
}

/// Minutes in `[from, to)` where at least one component has a bar
fn candidate_minutes(
    conn: &Connection,
    spec: &CompositeSpec,
    from: i64,
    to: i64,
) -> Result<Vec<i64>, PipelineError> {
    let placeholders = vec!["?"; spec.components.len()].join(", ");
    let sql = format!(
        "SELECT DISTINCT ts_utc FROM data_bars
         WHERE timeframe = '1m' AND ts_utc >= ? AND ts_utc < ?
           AND canonical_symbol IN ({})
         ORDER BY ts_utc",
        placeholders
    );

    let mut values: Vec<rusqlite::types::Value> = vec![from.into(), to.into()];
    values.extend(spec.components.iter().map(|c| c.symbol.to_string().into()));

    let mut stmt = conn.prepare(&sql)?;
    let minutes = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(minutes)
}

/// Compute and upsert composite bars for every complete minute in `[from, to)`
pub fn compute_composite_range(
    conn: &Connection,
    spec: &CompositeSpec,
    from: i64,
    to: i64,
    now: i64,
) -> Result<CompositeReport, PipelineError> {
    if from >= to {
        return Err(PipelineError::InvalidWindow { start: from, end: to });
    }

    let raw = spec.raw_payload()?;
    let mut report = CompositeReport::default();

    for ts_utc in candidate_minutes(conn, spec, from, to)? {
        let tx = conn.unchecked_transaction()?;

        let closes = spec
            .components
            .iter()
            .map(|c| component_close(&tx, c.symbol, ts_utc))
            .collect::<Result<Vec<_>, _>>()?;

        let Some(value) = spec.value(&closes) else {
            report.skipped += 1;
            continue;
        };

        let bar = Bar {
            symbol: spec.symbol.to_string(),
            timeframe: Timeframe::M1,
            ts_utc,
            open: value,
            high: value,
            low: value,
            close: value,
            volume: 0.0,
            vwap: None,
            trade_count: 0,
        };
        if upsert_base_bar(&tx, &bar, SOURCE_SYNTHETIC, Some(&raw), now)? {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }
        tx.commit()?;
    }

    log::debug!(
        "💵 {} composite [{}, {}): {} inserted, {} updated, {} skipped",
        spec.symbol, from, to, report.inserted, report.updated, report.skipped
    );
    Ok(report)
}

/// Last minute the producer has covered, from its `ingest_state` row
///
/// The second value is true when the entry has been orphaned.
fn producer_state(conn: &Connection, spec: &CompositeSpec) -> Result<(Option<i64>, bool), PipelineError> {
    let state: Option<(Option<i64>, bool)> = conn
        .query_row(
            "SELECT last_bar_ts, status = 'orphaned' FROM ingest_state
             WHERE canonical_symbol = ?1 AND timeframe = ?2",
            params![spec.symbol, Timeframe::M1.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(state.unwrap_or((None, false)))
}

fn record_progress(conn: &Connection, spec: &CompositeSpec, through: i64, now: i64) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO ingest_state (canonical_symbol, timeframe, status, last_bar_ts, updated_at)
         VALUES (?1, ?2, 'idle', ?3, ?4)
         ON CONFLICT(canonical_symbol, timeframe) DO UPDATE SET
             last_bar_ts = MAX(COALESCE(ingest_state.last_bar_ts, excluded.last_bar_ts), excluded.last_bar_ts),
             updated_at = excluded.updated_at",
        params![spec.symbol, Timeframe::M1.as_str(), through, now],
    )?;
    Ok(())
}

/// Range `[from, to)` the producer should cover at `now`
///
/// Starts at the earlier of the trailing lookback and the minute after
/// the last one covered, never before the earliest `min_start` of the
/// composite's own aggregation tasks. With no progress recorded yet it
/// starts at that `min_start`. At most `max_span_secs` per run; the
/// current, still open minute is excluded.
pub fn composite_refresh_range(
    conn: &Connection,
    spec: &CompositeSpec,
    now: i64,
    lookback_secs: i64,
    max_span_secs: i64,
) -> Result<Option<(i64, i64)>, PipelineError> {
    let minute = Timeframe::M1.seconds();
    let (covered, _) = producer_state(conn, spec)?;
    let task_floor: Option<i64> = conn.query_row(
        "SELECT MIN(min_start_ts) FROM aggregation_tasks WHERE canonical_symbol = ?1",
        [spec.symbol],
        |row| row.get(0),
    )?;

    let recent = align_down(now - lookback_secs, minute);
    let from = match (covered, task_floor) {
        (Some(last), floor) => (last + minute).min(recent).max(floor.unwrap_or(i64::MIN)),
        (None, Some(floor)) => align_down(floor, minute),
        (None, None) => recent,
    };
    let to = align_down(now.min(from.saturating_add(max_span_secs)), minute);

    Ok((from < to).then_some((from, to)))
}

/// One producer pass: compute the refresh range and record progress
///
/// Returns None when there is nothing to cover or the producer's entry
/// has been orphaned.
pub fn refresh_composite(
    conn: &Connection,
    spec: &CompositeSpec,
    now: i64,
    lookback_secs: i64,
    max_span_secs: i64,
) -> Result<Option<CompositeReport>, PipelineError> {
    if producer_state(conn, spec)?.1 {
        log::debug!("👻 {} composite entry orphaned, not refreshing", spec.symbol);
        return Ok(None);
    }

    let Some((from, to)) = composite_refresh_range(conn, spec, now, lookback_secs, max_span_secs)? else {
        return Ok(None);
    };

    let report = compute_composite_range(conn, spec, from, to, now)?;
    record_progress(conn, spec, to - Timeframe::M1.seconds(), now)?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::read_bars_in_window;
    use crate::pipeline::db::test_support::{memory_db, minute_bar};

    const QUOTES: [(&str, f64); 6] = [
        ("EURUSD", 1.08),
        ("USDJPY", 150.0),
        ("GBPUSD", 1.27),
        ("USDCAD", 1.36),
        ("USDSEK", 10.5),
        ("USDCHF", 0.88),
    ];

    fn seed_quotes(conn: &Connection, ts: i64, skip: Option<&str>) {
        for (symbol, close) in QUOTES {
            if Some(symbol) == skip {
                continue;
            }
            upsert_base_bar(conn, &minute_bar(symbol, ts, close), "massive", None, ts).unwrap();
        }
    }

    fn expected_dxy() -> f64 {
        50.14348112
            * 1.08_f64.powf(-0.576)
            * 150.0_f64.powf(0.136)
            * 1.27_f64.powf(-0.119)
            * 1.36_f64.powf(0.091)
            * 10.5_f64.powf(0.042)
            * 0.88_f64.powf(0.036)
    }

    #[test]
    fn test_value_matches_formula() {
        let closes: Vec<Option<f64>> = QUOTES.iter().map(|(_, c)| Some(*c)).collect();
        let value = DXY.value(&closes).unwrap();
        assert!((value - expected_dxy()).abs() < 1e-9);
        assert!(value > 90.0 && value < 120.0);
    }

    #[test]
    fn test_value_requires_every_positive_component() {
        let mut closes: Vec<Option<f64>> = QUOTES.iter().map(|(_, c)| Some(*c)).collect();
        closes[3] = None;
        assert_eq!(DXY.value(&closes), None);
        closes[3] = Some(0.0);
        assert_eq!(DXY.value(&closes), None);
        assert_eq!(DXY.value(&closes[..5]), None);
    }

    #[test]
    fn test_range_writes_complete_minutes_only() {
        let conn = memory_db();
        seed_quotes(&conn, 0, None);
        seed_quotes(&conn, 60, Some("USDSEK"));
        seed_quotes(&conn, 120, None);

        let report = compute_composite_range(&conn, &DXY, 0, 180, 500).unwrap();
        assert_eq!(
            report,
            CompositeReport {
                inserted: 2,
                updated: 0,
                skipped: 1
            }
        );

        let bars = read_bars_in_window(&conn, "DXY", Timeframe::M1, 0, 180).unwrap();
        assert_eq!(bars.iter().map(|b| b.ts_utc).collect::<Vec<_>>(), vec![0, 120]);
        let bar = &bars[0];
        assert_eq!(bar.open, bar.close);
        assert_eq!(bar.high, bar.low);
        assert_eq!(bar.volume, 0.0);
        assert_eq!(bar.vwap, None);
        assert!((bar.close - expected_dxy()).abs() < 1e-9);

        let (source, raw): (String, String) = conn
            .query_row(
                "SELECT source, raw FROM data_bars WHERE canonical_symbol = 'DXY' AND ts_utc = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(source, SOURCE_SYNTHETIC);
        let raw: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(raw["kind"], "dxy");
        assert_eq!(raw["version"], 1);
    }

    #[test]
    fn test_rerun_updates_in_place() {
        let conn = memory_db();
        seed_quotes(&conn, 0, None);

        compute_composite_range(&conn, &DXY, 0, 60, 100).unwrap();
        let again = compute_composite_range(&conn, &DXY, 0, 60, 200).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 1);
    }

    #[test]
    fn test_empty_or_inverted_range() {
        let conn = memory_db();
        assert_eq!(
            compute_composite_range(&conn, &DXY, 0, 600, 0).unwrap(),
            CompositeReport::default()
        );
        assert!(compute_composite_range(&conn, &DXY, 600, 600, 0).is_err());
    }

    const T0: i64 = 1_767_225_600;

    fn covered_through(conn: &Connection) -> Option<i64> {
        producer_state(conn, &DXY).unwrap().0
    }

    #[test]
    fn test_refresh_resumes_after_downtime() {
        let conn = memory_db();
        for i in 0..180 {
            seed_quotes(&conn, T0 + i * 60, None);
        }
        // Last pass covered up to just before T0, then the worker was down 3h
        record_progress(&conn, &DXY, T0 - 60, T0).unwrap();

        let now = T0 + 3 * 3_600 + 600;
        let report = refresh_composite(&conn, &DXY, now, 3_600, 86_400).unwrap().unwrap();
        assert_eq!(report.inserted, 180);
        assert_eq!(covered_through(&conn), Some(now - 60));

        // Steady state: only the trailing lookback is recomputed
        assert_eq!(
            composite_refresh_range(&conn, &DXY, now + 60, 3_600, 86_400).unwrap(),
            Some((now + 60 - 3_600, now + 60))
        );
    }

    #[test]
    fn test_refresh_catches_up_in_capped_steps_across_gaps() {
        let conn = memory_db();
        seed_quotes(&conn, T0 + 7_200, None);
        record_progress(&conn, &DXY, T0 - 60, T0).unwrap();
        let now = T0 + 10 * 3_600;

        // Two empty hours still move progress forward
        for _ in 0..2 {
            let report = refresh_composite(&conn, &DXY, now, 3_600, 3_600).unwrap().unwrap();
            assert_eq!(report, CompositeReport::default());
        }
        assert_eq!(covered_through(&conn), Some(T0 + 7_200 - 60));

        let report = refresh_composite(&conn, &DXY, now, 3_600, 3_600).unwrap().unwrap();
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn test_first_refresh_starts_at_task_min_start() {
        use crate::pipeline::tasks::test_support::five_minute_task;
        use crate::pipeline::tasks::{insert_task, NewTask};

        let conn = memory_db();
        insert_task(
            &conn,
            &NewTask {
                min_start: T0,
                ..five_minute_task("DXY", true)
            },
            T0,
            0,
        )
        .unwrap();

        let range = composite_refresh_range(&conn, &DXY, T0 + 5 * 3_600 + 30, 3_600, 86_400).unwrap();
        assert_eq!(range, Some((T0, T0 + 5 * 3_600)));

        // Without tasks or progress: trailing lookback only
        let bare = memory_db();
        let range = composite_refresh_range(&bare, &DXY, T0 + 600, 3_600, 86_400).unwrap();
        assert_eq!(range, Some((T0 - 3_000, T0 + 600)));
    }

    #[test]
    fn test_orphaned_producer_entry_not_refreshed() {
        let conn = memory_db();
        seed_quotes(&conn, T0, None);
        record_progress(&conn, &DXY, T0 - 60, T0).unwrap();
        conn.execute("UPDATE ingest_state SET status = 'orphaned' WHERE canonical_symbol = 'DXY'", [])
            .unwrap();

        assert_eq!(refresh_composite(&conn, &DXY, T0 + 600, 3_600, 86_400).unwrap(), None);
        assert!(read_bars_in_window(&conn, "DXY", Timeframe::M1, T0, T0 + 60).unwrap().is_empty());
    }
}

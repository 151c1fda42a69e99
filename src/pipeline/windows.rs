//! Window Aggregator: one `[start, end)` window of source bars into one
//! target bar

use super::db::{count_misplaced_rows, read_bars_in_window, table_for, upsert_derived_bar};
use super::error::PipelineError;
use super::types::{Bar, DerivedBar, Timeframe, WindowOutcome, SOURCE_AGGREGATED};

/// Bumped whenever the rollup arithmetic changes
pub const DERIVATION_VERSION: i64 = 1;

pub const REASON_INSUFFICIENT: &str = "insufficient_source_bars";

/// Maps an observed source bar count to a quality score
///
/// With `expected` source bars per window:
/// - `count >= expected` → 2
/// - `count >= ceil(0.8 * expected)` → 1
/// - `count >= ceil(0.6 * expected)` → 0
/// - anything less is not stored
///
/// For 5m from 1m this is 5 → 2, 4 → 1, 3 → 0, below 3 skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPolicy {
    pub expected: i64,
}

impl QualityPolicy {
    pub const MAX_SCORE: i32 = 2;

    pub fn new(expected: i64) -> Self {
        Self {
            expected: expected.max(1),
        }
    }

    /// Policy for a window of `window_secs` filled with `source` bars
    pub fn for_window(window_secs: i64, source: Timeframe) -> Self {
        Self::new(window_secs / source.seconds())
    }

    fn ceil_fraction(&self, fifths: i64) -> i64 {
        (self.expected * fifths + 4) / 5
    }

    pub fn score(&self, count: i64) -> Option<i32> {
        if count >= self.expected {
            Some(2)
        } else if count >= self.ceil_fraction(4) {
            Some(1)
        } else if count >= self.ceil_fraction(3) {
            Some(0)
        } else {
            None
        }
    }
}

/// Roll ordered source bars up into one target bar
///
/// Open is the first open, close the last close, high/low the extremes.
/// VWAP is volume-weighted over each source's VWAP (close when missing)
/// and None when total volume is zero.
pub fn rollup(symbol: &str, target: Timeframe, start: i64, bars: &[Bar]) -> Option<Bar> {
    let first = bars.first()?;
    let last = bars.last()?;

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    let mut notional = 0.0;
    let mut trade_count = 0;

    for bar in bars {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
        notional += bar.vwap.unwrap_or(bar.close) * bar.volume;
        trade_count += bar.trade_count;
    }

    Some(Bar {
        symbol: symbol.to_string(),
        timeframe: target,
        ts_utc: start,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        vwap: if volume > 0.0 { Some(notional / volume) } else { None },
        trade_count,
    })
}

/// Aggregate the source bars of one window into the derived table
///
/// The store happens in its own transaction. A window without any source
/// bars is the data frontier and writes nothing.
pub fn aggregate_window(
    conn: &rusqlite::Connection,
    symbol: &str,
    source: Timeframe,
    target: Timeframe,
    start: i64,
    end: i64,
    now: i64,
) -> Result<WindowOutcome, PipelineError> {
    if end <= start {
        return Err(PipelineError::InvalidWindow { start, end });
    }

    let misplaced = count_misplaced_rows(conn, symbol, source, start, end)?;
    if misplaced > 0 {
        return Err(PipelineError::ArchitectureViolation(format!(
            "{} {} rows for {} in [{}, {}) outside {}",
            misplaced,
            source,
            symbol,
            start,
            end,
            table_for(source)
        )));
    }

    let bars = read_bars_in_window(conn, symbol, source, start, end)?;
    let source_count = bars.len() as i64;

    let Some(bar) = rollup(symbol, target, start, &bars) else {
        return Ok(WindowOutcome::SkippedFrontier);
    };

    let policy = QualityPolicy::for_window(end - start, source);
    let Some(quality_score) = policy.score(source_count) else {
        log::debug!(
            "⏭️  {} {} @ {}: {} of {} source bars, not stored",
            symbol, target, start, source_count, policy.expected
        );
        return Ok(WindowOutcome::SkippedLowQuality {
            source_count,
            reason: REASON_INSUFFICIENT,
        });
    };

    let derived = DerivedBar {
        bar,
        source_count,
        quality_score,
        source: SOURCE_AGGREGATED.to_string(),
        derivation_version: DERIVATION_VERSION,
    };

    let tx = conn.unchecked_transaction()?;
    upsert_derived_bar(&tx, &derived, now)?;
    tx.commit()?;

    Ok(WindowOutcome::Stored {
        source_count,
        quality_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::get_derived_bar;
    use crate::pipeline::db::test_support::{memory_db, minute_bar, seed_minutes};

    #[test]
    fn test_quality_boundaries_for_five_minutes() {
        let policy = QualityPolicy::for_window(300, Timeframe::M1);
        assert_eq!(policy.expected, 5);
        assert_eq!(policy.score(5), Some(2));
        assert_eq!(policy.score(4), Some(1));
        assert_eq!(policy.score(3), Some(0));
        assert_eq!(policy.score(2), None);
        assert_eq!(policy.score(0), None);
    }

    #[test]
    fn test_quality_for_coarser_windows() {
        // 1h from 5m: 12 expected, ceil(9.6) = 10, ceil(7.2) = 8
        let policy = QualityPolicy::for_window(3_600, Timeframe::M5);
        assert_eq!(policy.score(12), Some(2));
        assert_eq!(policy.score(10), Some(1));
        assert_eq!(policy.score(9), Some(0));
        assert_eq!(policy.score(8), Some(0));
        assert_eq!(policy.score(7), None);
    }

    #[test]
    fn test_full_window_rollup_values() {
        let conn = memory_db();
        seed_minutes(&conn, "EURUSD", 0, 5);

        let outcome = aggregate_window(&conn, "EURUSD", Timeframe::M1, Timeframe::M5, 0, 300, 1_000)
            .unwrap();
        assert_eq!(
            outcome,
            WindowOutcome::Stored {
                source_count: 5,
                quality_score: 2
            }
        );

        let derived = get_derived_bar(&conn, "EURUSD", Timeframe::M5, 0).unwrap().unwrap();
        assert_eq!(derived.bar.open, 100.0);
        assert_eq!(derived.bar.close, 104.0);
        assert_eq!(derived.bar.high, 104.5);
        assert_eq!(derived.bar.low, 99.5);
        assert_eq!(derived.bar.volume, 50.0);
        assert_eq!(derived.bar.vwap, Some(102.0));
        assert_eq!(derived.bar.trade_count, 15);
        assert_eq!(derived.source, SOURCE_AGGREGATED);
        assert_eq!(derived.derivation_version, DERIVATION_VERSION);
    }

    #[test]
    fn test_partial_windows_scored_or_skipped() {
        let conn = memory_db();
        seed_minutes(&conn, "A", 0, 4);
        seed_minutes(&conn, "B", 0, 3);
        seed_minutes(&conn, "C", 0, 2);

        let four = aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 0, 300, 0).unwrap();
        let three = aggregate_window(&conn, "B", Timeframe::M1, Timeframe::M5, 0, 300, 0).unwrap();
        let two = aggregate_window(&conn, "C", Timeframe::M1, Timeframe::M5, 0, 300, 0).unwrap();

        assert_eq!(four.quality_score(), Some(1));
        assert_eq!(three.quality_score(), Some(0));
        assert_eq!(
            two,
            WindowOutcome::SkippedLowQuality {
                source_count: 2,
                reason: REASON_INSUFFICIENT
            }
        );
        assert!(get_derived_bar(&conn, "C", Timeframe::M5, 0).unwrap().is_none());
    }

    #[test]
    fn test_empty_window_is_frontier() {
        let conn = memory_db();
        let outcome = aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 0, 300, 0).unwrap();
        assert_eq!(outcome, WindowOutcome::SkippedFrontier);
        assert_eq!(outcome.source_count(), 0);
    }

    #[test]
    fn test_reaggregation_is_idempotent() {
        let conn = memory_db();
        seed_minutes(&conn, "A", 0, 5);

        aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 0, 300, 10).unwrap();
        let first = get_derived_bar(&conn, "A", Timeframe::M5, 0).unwrap();
        aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 0, 300, 20).unwrap();
        let second = get_derived_bar(&conn, "A", Timeframe::M5, 0).unwrap();

        assert_eq!(first, second);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM derived_data_bars", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_zero_volume_has_no_vwap() {
        let mut bar = minute_bar("A", 0, 1.0);
        bar.volume = 0.0;
        let rolled = rollup("A", Timeframe::M5, 0, &[bar]).unwrap();
        assert_eq!(rolled.vwap, None);
        assert!(rollup("A", Timeframe::M5, 0, &[]).is_none());
    }

    #[test]
    fn test_invalid_window_rejected() {
        let conn = memory_db();
        assert!(matches!(
            aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 300, 300, 0),
            Err(PipelineError::InvalidWindow { start: 300, end: 300 })
        ));
    }

    #[test]
    fn test_misplaced_base_rows_are_architecture_violation() {
        let conn = memory_db();
        seed_minutes(&conn, "A", 0, 5);
        conn.execute(
            "INSERT INTO derived_data_bars (canonical_symbol, timeframe, ts_utc, open, high, low,
                close, vol, source_count, quality_score, source, derivation_version, created_at,
                updated_at)
             VALUES ('A', '1m', 60, 1, 1, 1, 1, 1, 1, 2, 'rogue', 1, 0, 0)",
            [],
        )
        .unwrap();

        let err = aggregate_window(&conn, "A", Timeframe::M1, Timeframe::M5, 0, 300, 0).unwrap_err();
        assert!(err.is_hard());
        assert!(get_derived_bar(&conn, "A", Timeframe::M5, 0).unwrap().is_none());
    }
}

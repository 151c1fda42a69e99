//! Core data structures for the bar rollup pipeline
//!
//! Table mapping (see `db::MIGRATIONS`):
//! - `data_bars` → `Bar` (base resolution only, `1m`)
//! - `derived_data_bars` → `DerivedBar` (every coarser resolution)
//! - `aggregation_tasks` → `AggregationTask`
//!
//! All timestamps are Unix seconds (UTC).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance tag for bars written by the composite producer
pub const SOURCE_SYNTHETIC: &str = "synthetic";

/// Provenance tag for bars written by the window aggregator
pub const SOURCE_AGGREGATED: &str = "aggregated";

/// Bar timeframes known to the pipeline
///
/// Variant order is ascending duration, so the derived `Ord` sorts
/// finer timeframes before coarser ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Window duration in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// The finest resolution, stored in the base table
    pub fn is_base(&self) -> bool {
        matches!(self, Timeframe::M1)
    }

    /// Next-lower resolution this timeframe is rolled up from
    ///
    /// Returns None for the base timeframe.
    pub fn default_source(&self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => None,
            Timeframe::M5 => Some(Timeframe::M1),
            Timeframe::M15 | Timeframe::M30 | Timeframe::H1 => Some(Timeframe::M5),
            Timeframe::H4 | Timeframe::D1 => Some(Timeframe::H1),
        }
    }

    /// Parse a comma-separated list such as `5m,1h,1d`
    pub fn parse_list(raw: &str) -> Result<Vec<Timeframe>, String> {
        let mut out = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let tf = part.parse::<Timeframe>()?;
            if !out.contains(&tf) {
                out.push(tf);
            }
        }
        out.sort();
        Ok(out)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| format!("unknown timeframe '{}'", s))
    }
}

/// OHLCV bar as read from either table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Window start
    pub ts_utc: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
    pub trade_count: i64,
}

/// Bar produced by the window aggregator (row in `derived_data_bars`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedBar {
    pub bar: Bar,
    pub source_count: i64,
    pub quality_score: i32,
    pub source: String,
    pub derivation_version: i64,
}

/// Lifecycle status of an aggregation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    HardFailed,
    Disabled,
    /// Instrument left the active registry; terminal until manual reset
    Orphaned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::HardFailed => "hard_failed",
            TaskStatus::Disabled => "disabled",
            TaskStatus::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "hard_failed" => Ok(TaskStatus::HardFailed),
            "disabled" => Ok(TaskStatus::Disabled),
            "orphaned" => Ok(TaskStatus::Orphaned),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// One row of `aggregation_tasks`: a (symbol, target timeframe) rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTask {
    pub id: i64,
    pub symbol: String,
    pub target_timeframe: Timeframe,
    pub source_timeframe: Timeframe,
    /// Start of the next window to process; None until bootstrapped
    pub cursor: Option<i64>,
    pub run_interval_secs: i64,
    pub confirmation_delay_secs: i64,
    pub min_start: i64,
    pub status: TaskStatus,
    pub enabled: bool,
    pub mandatory: bool,
    pub priority: i64,
    pub fail_streak: i64,
    pub last_error: Option<String>,
    pub last_success_at: Option<i64>,
    pub next_due_at: i64,
    pub notes: Option<String>,
}

impl AggregationTask {
    /// Lowest value the cursor may ever hold
    pub fn cursor_floor(&self) -> i64 {
        self.min_start - self.run_interval_secs
    }
}

/// Result of aggregating a single window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WindowOutcome {
    /// Bar upserted into the derived table
    Stored { source_count: i64, quality_score: i32 },
    /// Source rows exist but too few to store a bar
    SkippedLowQuality {
        source_count: i64,
        reason: &'static str,
    },
    /// No source rows at all: the data frontier
    SkippedFrontier,
}

impl WindowOutcome {
    /// Observed source bar count (zero at the frontier)
    pub fn source_count(&self) -> i64 {
        match self {
            WindowOutcome::Stored { source_count, .. } => *source_count,
            WindowOutcome::SkippedLowQuality { source_count, .. } => *source_count,
            WindowOutcome::SkippedFrontier => 0,
        }
    }

    pub fn stored(&self) -> bool {
        matches!(self, WindowOutcome::Stored { .. })
    }

    pub fn quality_score(&self) -> Option<i32> {
        match self {
            WindowOutcome::Stored { quality_score, .. } => Some(*quality_score),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            WindowOutcome::Stored { .. } => None,
            WindowOutcome::SkippedLowQuality { reason, .. } => Some(reason),
            WindowOutcome::SkippedFrontier => Some("no_source_bars"),
        }
    }
}

/// Why a catch-up loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Empty source window: nothing more to aggregate yet
    Frontier,
    /// Next window has not passed its confirmation delay
    AwaitingConfirmation,
    /// Sibling task for the source timeframe has not rolled up the whole
    /// next window yet
    AwaitingSource,
    /// Hit `max_windows`; more work likely remains
    WindowBudget,
}

/// Result of one catch-up invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatchupResult {
    pub windows_processed: u32,
    pub new_cursor: i64,
    /// Bars stored (any quality score)
    pub bars_created: u32,
    /// Stored bars with a quality score below the maximum
    pub bars_low_quality: u32,
    /// Windows with source rows but too few to store
    pub bars_skipped: u32,
    pub exhausted_budget: bool,
    pub stop_reason: StopReason,
}

/// What the orchestrator reports back for a claimed task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(CatchupResult),
    Failure {
        error: String,
        /// Escalate immediately instead of counting toward the streak
        hard: bool,
    },
}

/// State after `finish_task` committed a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedTask {
    pub task_id: i64,
    pub status: TaskStatus,
    pub fail_streak: i64,
    pub next_due_at: i64,
}

/// Per-task row of the read-only health view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHealth {
    pub task_id: i64,
    pub symbol: String,
    pub target_timeframe: Timeframe,
    pub status: TaskStatus,
    pub enabled: bool,
    pub mandatory: bool,
    pub cursor: Option<i64>,
    /// `now - cursor`; None for tasks never bootstrapped
    pub cursor_lag_secs: Option<i64>,
    pub fail_streak: i64,
    pub last_error: Option<String>,
    pub last_success_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_order_is_finest_first() {
        let parsed = Timeframe::parse_list("1d, 5m,1h,5m").unwrap();
        assert_eq!(parsed, vec![Timeframe::M5, Timeframe::H1, Timeframe::D1]);
        assert!(Timeframe::parse_list("2m").is_err());
    }

    #[test]
    fn test_default_source_chain() {
        assert_eq!(Timeframe::M1.default_source(), None);
        assert_eq!(Timeframe::M5.default_source(), Some(Timeframe::M1));
        assert_eq!(Timeframe::H1.default_source(), Some(Timeframe::M5));
        assert_eq!(Timeframe::D1.default_source(), Some(Timeframe::H1));
        for tf in Timeframe::ALL {
            if let Some(src) = tf.default_source() {
                assert_eq!(tf.seconds() % src.seconds(), 0);
            }
        }
    }

    #[test]
    fn test_window_outcome_source_count() {
        assert_eq!(WindowOutcome::SkippedFrontier.source_count(), 0);
        let skipped = WindowOutcome::SkippedLowQuality {
            source_count: 2,
            reason: "insufficient_source_bars",
        };
        assert_eq!(skipped.source_count(), 2);
        assert!(!skipped.stored());
        assert_eq!(skipped.quality_score(), None);
        assert_eq!(skipped.reason(), Some("insufficient_source_bars"));
    }

    #[test]
    fn test_task_status_roundtrip_strings() {
        for status in [
            TaskStatus::Idle,
            TaskStatus::Running,
            TaskStatus::HardFailed,
            TaskStatus::Disabled,
            TaskStatus::Orphaned,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }
}

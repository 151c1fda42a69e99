//! Aggregation runtime configuration from environment variables

use super::types::Timeframe;
use std::env;

/// Default `min_start` for new tasks: 2025-12-31T00:00:00Z
pub const DEFAULT_MIN_START_TS: i64 = 1_767_139_200;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the aggregation job
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Wall-clock budget for one run, checked before each task claim
    pub execution_budget_ms: u64,

    /// Job lease duration; must dwarf the execution budget
    pub lock_lease_secs: i64,

    /// Catch-up bound per task per run
    pub max_windows_per_task: u32,

    /// Due-task selection limit per run
    pub task_batch_size: u32,

    /// Failures tolerated before hard_failed (mandatory) / disabled (optional)
    pub fail_streak_threshold: i64,

    /// Confirmation delay given to newly created tasks
    pub confirmation_delay_secs: i64,

    /// `min_start` given to newly created tasks
    pub default_min_start: i64,

    /// Target timeframes created per active instrument by registry sync
    pub target_timeframes: Vec<Timeframe>,

    /// Periodic trigger interval
    pub run_interval_ms: u64,

    /// Failure backoff: base * 2^(streak-1), capped at max
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,

    /// Recompute the synthetic composite at the start of each run
    pub composite_enabled: bool,

    /// How far back the composite producer recomputes each run
    pub composite_lookback_secs: i64,

    /// Longest range the composite producer covers in one run while
    /// catching up after downtime
    pub composite_max_span_secs: i64,

    /// Lock scope
    pub job_name: String,

    /// Lease owner identity for this worker instance
    pub worker_id: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            db_path: "data/barflow.db".to_string(),
            execution_budget_ms: 25_000,
            lock_lease_secs: 300,
            max_windows_per_task: 100,
            task_batch_size: 50,
            fail_streak_threshold: 3,
            confirmation_delay_secs: 300,
            default_min_start: DEFAULT_MIN_START_TS,
            target_timeframes: vec![Timeframe::M5, Timeframe::H1, Timeframe::D1],
            run_interval_ms: 60_000,
            backoff_base_secs: 60,
            backoff_max_secs: 3_600,
            composite_enabled: true,
            composite_lookback_secs: 3_600,
            composite_max_span_secs: 86_400,
            job_name: "aggregation".to_string(),
            worker_id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl AggregationConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `AGG_DB_PATH` (default: data/barflow.db)
    /// - `AGG_EXECUTION_BUDGET_MS` (default: 25000)
    /// - `AGG_LOCK_LEASE_SECS` (default: 300)
    /// - `AGG_MAX_WINDOWS_PER_TASK` (default: 100)
    /// - `AGG_TASK_BATCH_SIZE` (default: 50)
    /// - `AGG_FAIL_STREAK_THRESHOLD` (default: 3)
    /// - `AGG_CONFIRMATION_DELAY_SECS` (default: 300)
    /// - `AGG_MIN_START_TS` (default: 1767139200)
    /// - `AGG_TARGET_TIMEFRAMES` (default: 5m,1h,1d)
    /// - `AGG_RUN_INTERVAL_MS` (default: 60000)
    /// - `AGG_BACKOFF_BASE_SECS` / `AGG_BACKOFF_MAX_SECS` (default: 60 / 3600)
    /// - `AGG_COMPOSITE_ENABLED` (default: true)
    /// - `AGG_COMPOSITE_LOOKBACK_SECS` (default: 3600)
    /// - `AGG_COMPOSITE_MAX_SPAN_SECS` (default: 86400)
    /// - `AGG_JOB_NAME` (default: aggregation)
    /// - `AGG_WORKER_ID` (default: worker-<pid>-<random>)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let target_timeframes = match env::var("AGG_TARGET_TIMEFRAMES") {
            Ok(raw) => Timeframe::parse_list(&raw).map_err(ConfigError::InvalidValue)?,
            Err(_) => defaults.target_timeframes.clone(),
        };

        let config = Self {
            db_path: env::var("AGG_DB_PATH").unwrap_or(defaults.db_path),
            execution_budget_ms: env_parse("AGG_EXECUTION_BUDGET_MS", defaults.execution_budget_ms),
            lock_lease_secs: env_parse("AGG_LOCK_LEASE_SECS", defaults.lock_lease_secs),
            max_windows_per_task: env_parse("AGG_MAX_WINDOWS_PER_TASK", defaults.max_windows_per_task),
            task_batch_size: env_parse("AGG_TASK_BATCH_SIZE", defaults.task_batch_size),
            fail_streak_threshold: env_parse("AGG_FAIL_STREAK_THRESHOLD", defaults.fail_streak_threshold),
            confirmation_delay_secs: env_parse(
                "AGG_CONFIRMATION_DELAY_SECS",
                defaults.confirmation_delay_secs,
            ),
            default_min_start: env_parse("AGG_MIN_START_TS", defaults.default_min_start),
            target_timeframes,
            run_interval_ms: env_parse("AGG_RUN_INTERVAL_MS", defaults.run_interval_ms),
            backoff_base_secs: env_parse("AGG_BACKOFF_BASE_SECS", defaults.backoff_base_secs),
            backoff_max_secs: env_parse("AGG_BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            composite_enabled: env::var("AGG_COMPOSITE_ENABLED")
                .ok()
                .and_then(|s| s.to_lowercase().parse().ok())
                .unwrap_or(defaults.composite_enabled),
            composite_lookback_secs: env_parse(
                "AGG_COMPOSITE_LOOKBACK_SECS",
                defaults.composite_lookback_secs,
            ),
            composite_max_span_secs: env_parse(
                "AGG_COMPOSITE_MAX_SPAN_SECS",
                defaults.composite_max_span_secs,
            ),
            job_name: env::var("AGG_JOB_NAME").unwrap_or(defaults.job_name),
            worker_id: env::var("AGG_WORKER_ID").unwrap_or(defaults.worker_id),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Lease must exceed the run budget by an order of magnitude
        let lease_ms = self.lock_lease_secs.max(0) as u64 * 1_000;
        if lease_ms < self.execution_budget_ms.saturating_mul(10) {
            return Err(ConfigError::InvalidValue(format!(
                "AGG_LOCK_LEASE_SECS ({}s) must be at least 10x AGG_EXECUTION_BUDGET_MS ({}ms)",
                self.lock_lease_secs, self.execution_budget_ms
            )));
        }

        if self.max_windows_per_task == 0 {
            return Err(ConfigError::InvalidValue(
                "AGG_MAX_WINDOWS_PER_TASK must be > 0".to_string(),
            ));
        }

        if self.task_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "AGG_TASK_BATCH_SIZE must be > 0".to_string(),
            ));
        }

        if self.fail_streak_threshold <= 0 {
            return Err(ConfigError::InvalidValue(
                "AGG_FAIL_STREAK_THRESHOLD must be > 0".to_string(),
            ));
        }

        if self.confirmation_delay_secs < 0 {
            return Err(ConfigError::InvalidValue(
                "AGG_CONFIRMATION_DELAY_SECS cannot be negative".to_string(),
            ));
        }

        if self.target_timeframes.is_empty() {
            return Err(ConfigError::MissingVariable("AGG_TARGET_TIMEFRAMES".to_string()));
        }

        if self.target_timeframes.iter().any(|tf| tf.is_base()) {
            return Err(ConfigError::InvalidValue(
                "AGG_TARGET_TIMEFRAMES cannot include the base timeframe 1m".to_string(),
            ));
        }

        if self.composite_lookback_secs < 0 || self.composite_max_span_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "AGG_COMPOSITE_LOOKBACK_SECS must be >= 0 and AGG_COMPOSITE_MAX_SPAN_SECS > 0".to_string(),
            ));
        }

        // A derived source is only complete once its own task has rolled it up
        let orphan_target = self.target_timeframes.iter().find(|tf| {
            tf.default_source()
                .is_some_and(|src| !src.is_base() && !self.target_timeframes.contains(&src))
        });
        if let Some(tf) = orphan_target {
            return Err(ConfigError::InvalidValue(format!(
                "AGG_TARGET_TIMEFRAMES includes {} but not its source timeframe {}",
                tf,
                tf.default_source().map(|src| src.as_str()).unwrap_or("?")
            )));
        }

        if self.job_name.is_empty() || self.worker_id.is_empty() {
            return Err(ConfigError::InvalidValue(
                "AGG_JOB_NAME and AGG_WORKER_ID cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AggregationConfig::default();

        assert_eq!(config.db_path, "data/barflow.db");
        assert_eq!(config.execution_budget_ms, 25_000);
        assert_eq!(config.lock_lease_secs, 300);
        assert_eq!(config.max_windows_per_task, 100);
        assert_eq!(config.fail_streak_threshold, 3);
        assert_eq!(config.default_min_start, DEFAULT_MIN_START_TS);
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        // Only this test touches these variables
        env::set_var("AGG_DB_PATH", "/tmp/agg-test.db");
        env::set_var("AGG_MAX_WINDOWS_PER_TASK", "12");
        env::set_var("AGG_TARGET_TIMEFRAMES", "1h,5m");
        env::set_var("AGG_COMPOSITE_ENABLED", "FALSE");

        let config = AggregationConfig::from_env().unwrap();

        assert_eq!(config.db_path, "/tmp/agg-test.db");
        assert_eq!(config.max_windows_per_task, 12);
        assert_eq!(config.target_timeframes, vec![Timeframe::M5, Timeframe::H1]);
        assert!(!config.composite_enabled);

        env::remove_var("AGG_DB_PATH");
        env::remove_var("AGG_MAX_WINDOWS_PER_TASK");
        env::remove_var("AGG_TARGET_TIMEFRAMES");
        env::remove_var("AGG_COMPOSITE_ENABLED");
    }

    #[test]
    fn test_lease_must_dwarf_budget() {
        let config = AggregationConfig {
            execution_budget_ms: 60_000,
            lock_lease_secs: 300,
            ..AggregationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_base_timeframe_rejected_as_target() {
        let config = AggregationConfig {
            target_timeframes: vec![Timeframe::M1, Timeframe::M5],
            ..AggregationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_target_requires_its_source_target() {
        let config = AggregationConfig {
            target_timeframes: vec![Timeframe::H1, Timeframe::D1],
            ..AggregationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let config = AggregationConfig {
            target_timeframes: vec![Timeframe::M5, Timeframe::H1, Timeframe::H4],
            ..AggregationConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}

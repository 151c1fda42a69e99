//! Error taxonomy for the aggregation pipeline
//!
//! Data-frontier stops and quality skips are not errors; they are reported
//! through `WindowOutcome` / `CatchupResult`.

#[derive(Debug)]
pub enum PipelineError {
    /// Storage failure; retryable on the next run
    Database(String),
    /// Aggregation window with `end <= start`
    InvalidWindow { start: i64, end: i64 },
    /// Missing task definition or invalid settings
    Configuration(String),
    /// Rows of a resolution found in the table that must not hold it
    ArchitectureViolation(String),
    /// Connection mutex poisoned by a panicking holder
    LockPoisoned,
}

impl PipelineError {
    /// Hard errors escalate a task at once instead of counting toward its fail streak
    pub fn is_hard(&self) -> bool {
        matches!(self, PipelineError::ArchitectureViolation(_))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Database(format!("serialization: {}", err))
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Database(e) => write!(f, "Database error: {}", e),
            PipelineError::InvalidWindow { start, end } => {
                write!(f, "Invalid window: end {} <= start {}", end, start)
            }
            PipelineError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::ArchitectureViolation(msg) => {
                write!(f, "Architecture violation: {}", msg)
            }
            PipelineError::LockPoisoned => write!(f, "Connection mutex poisoned"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        PipelineError::LockPoisoned
    }
}

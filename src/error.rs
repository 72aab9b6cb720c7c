use serde_json::json;

/// Failures surfaced by the scoring engine. `NoData` is deliberately absent:
/// an empty key is a result, not an error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("invalid weights: {0}")]
    InvalidWeights(String),
    #[error("invalid grade bands: {0}")]
    InvalidGradeBands(String),
    #[error("carry mark is being updated concurrently; gave up after {attempts} attempts")]
    ConcurrentUpdateConflict { attempts: u32 },
    #[error("carry mark not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DataUnavailable(_) => "data_unavailable",
            EngineError::InvalidWeights(_) => "invalid_weights",
            EngineError::InvalidGradeBands(_) => "invalid_grade_bands",
            EngineError::ConcurrentUpdateConflict { .. } => "concurrent_update_conflict",
            EngineError::NotFound => "not_found",
            EngineError::Storage(_) => "db_update_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::ConcurrentUpdateConflict { attempts } => {
                Some(json!({ "attempts": attempts, "retryable": true }))
            }
            EngineError::DataUnavailable(_) => Some(json!({ "retryable": true })),
            _ => None,
        }
    }

    /// Store read failures during extraction are transient from the caller's
    /// point of view, so they are reported as `DataUnavailable`.
    pub fn unavailable(context: &str, e: impl std::fmt::Display) -> Self {
        EngineError::DataUnavailable(format!("{context}: {e}"))
    }
}

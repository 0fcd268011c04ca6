use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the pipeline.
///
/// Every [`PipelineError`] variant maps to exactly one category via
/// [`PipelineError::category`]; the event router and worker pools branch on
/// the category, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Upstream timeout, rate-limit, connection reset: retry under backoff.
    Transient,
    /// QA-reported issue: routed to the Fix stage, not retried as-is.
    Logic,
    /// Malformed plan or missing dependency target: rejected at submission.
    Contract,
    /// Queue full or breaker open: shed to caller or DLQ after retries.
    Resource,
    /// Invariant violation: abort the request, leave the system consistent.
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Logic => "logic",
            ErrorCategory::Contract => "contract",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Fatal => "fatal",
        }
    }

    /// Whether a failure of this category is worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Resource)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("queue closed")]
    QueueClosed,

    #[error("circuit open for dependency {0}")]
    CircuitOpen(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("dependency cycle detected among: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("missing dependency target: {0}")]
    MissingDependency(String),

    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("stage execution failed: {0}")]
    StageExecutionFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("handler exhausted retries for event {event_id}")]
    RouterExhausted { event_id: String },

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Classify this error for retry/escalation decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Timeout(_) => ErrorCategory::Transient,
            PipelineError::Database(_) | PipelineError::Io(_) => ErrorCategory::Transient,
            PipelineError::QueueFull { .. } | PipelineError::CircuitOpen(_) => {
                ErrorCategory::Resource
            }
            PipelineError::QueueClosed => ErrorCategory::Resource,
            PipelineError::MalformedPlan(_)
            | PipelineError::MissingDependency(_)
            | PipelineError::Config(_) => ErrorCategory::Contract,
            PipelineError::InvalidStateTransition { .. } | PipelineError::CycleDetected(_) => {
                ErrorCategory::Fatal
            }
            PipelineError::StageExecutionFailed(_) => ErrorCategory::Logic,
            PipelineError::RouterExhausted { .. } => ErrorCategory::Resource,
            PipelineError::TaskNotFound(_) | PipelineError::DeploymentNotFound(_) => {
                ErrorCategory::Contract
            }
            PipelineError::Serialization(_) => ErrorCategory::Fatal,
            PipelineError::Other(_) => ErrorCategory::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Resource.is_retryable());
        assert!(!ErrorCategory::Logic.is_retryable());
        assert!(!ErrorCategory::Fatal.is_retryable());
    }

    #[test]
    fn test_error_category_mapping() {
        assert_eq!(
            PipelineError::QueueFull { capacity: 10 }.category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            PipelineError::CycleDetected(vec!["a".into()]).category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            PipelineError::StageExecutionFailed("boom".into()).category(),
            ErrorCategory::Logic
        );
    }
}

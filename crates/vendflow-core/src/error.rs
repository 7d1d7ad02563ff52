use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification reported by a task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    /// The downstream service is rate limiting us.
    Throttled,
    /// The payload or the response was rejected as invalid.
    ValidationFailed,
    /// The task did not answer within its time budget.
    Timeout,
    /// Anything else.
    Unknown,
}

impl TaskErrorKind {
    /// Whether a stage may retry this failure locally before surfacing it.
    pub fn is_retryable(self) -> bool {
        matches!(self, TaskErrorKind::Throttled | TaskErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskErrorKind::Throttled => "THROTTLED",
            TaskErrorKind::ValidationFailed => "VALIDATION_FAILED",
            TaskErrorKind::Timeout => "TIMEOUT",
            TaskErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure raised by a [`TaskExecutor`](crate::traits::TaskExecutor).
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("task {task} failed ({kind}): {message}")]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub task: String,
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(task: impl Into<String>, kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn throttled(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task, TaskErrorKind::Throttled, message)
    }

    pub fn validation(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task, TaskErrorKind::ValidationFailed, message)
    }

    pub fn timeout(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task, TaskErrorKind::Timeout, message)
    }

    pub fn unknown(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task, TaskErrorKind::Unknown, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum VendflowError {
    // Configuration errors: fatal, never routed through error transitions
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Missing required context field: {path}")]
    MissingField { path: String },

    #[error("Unknown verification type: {0:?}")]
    UnknownVerificationType(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Context conflict at {path}: {message}")]
    ContextConflict { path: String, message: String },

    // Runtime errors
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Workflow exceeded its deadline ({secs}s)")]
    WorkflowTimeout { secs: u64 },

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VendflowError {
    /// Configuration errors indicate a programming or input mistake and abort
    /// the execution instead of entering a recovery path.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            VendflowError::Config(_)
                | VendflowError::ConfigNotFound(_)
                | VendflowError::MissingField { .. }
                | VendflowError::UnknownVerificationType(_)
                | VendflowError::InvalidWorkflow(_)
                | VendflowError::StageNotFound(_)
                | VendflowError::ContextConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VendflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(TaskErrorKind::Throttled.is_retryable());
        assert!(TaskErrorKind::Timeout.is_retryable());
        assert!(!TaskErrorKind::ValidationFailed.is_retryable());
        assert!(!TaskErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_task_error_display() {
        let e = TaskError::throttled("invoke_bedrock", "rate exceeded");
        assert_eq!(
            e.to_string(),
            "task invoke_bedrock failed (THROTTLED): rate exceeded"
        );
    }

    #[test]
    fn test_task_error_serializes_camel_case() {
        let e = TaskError::validation("fetch_images", "bad url");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "VALIDATION_FAILED");
        assert_eq!(json["task"], "fetch_images");
    }

    #[test]
    fn test_configuration_classification() {
        assert!(VendflowError::MissingField { path: "a.b".into() }.is_configuration());
        assert!(VendflowError::UnknownVerificationType("x".into()).is_configuration());
        assert!(!VendflowError::WorkflowTimeout { secs: 900 }.is_configuration());
        assert!(!VendflowError::Task(TaskError::unknown("t", "boom")).is_configuration());
    }
}

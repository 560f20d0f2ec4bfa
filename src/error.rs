use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reason a candidate statement was rejected by the static validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Syntax,
    MultipleStatements,
    WriteOperation,
    UnknownTable,
    UnknownColumn,
    CrossJoinLimit,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::Syntax => "syntax",
            ValidationKind::MultipleStatements => "multiple-statements",
            ValidationKind::WriteOperation => "write-operation-attempted",
            ValidationKind::UnknownTable => "unknown-table",
            ValidationKind::UnknownColumn => "unknown-column",
            ValidationKind::CrossJoinLimit => "cross-join-limit",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Validation error ({kind}): {reason}")]
    Validation { kind: ValidationKind, reason: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout in step '{step}' after {after:?}")]
    Timeout { step: String, after: Duration },

    #[error("Retries exhausted for {what} after {attempts} attempts: {last}")]
    ExhaustedRetries {
        what: String,
        attempts: u32,
        last: String,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Failures of an external call that should be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Llm(_) | AgentError::Timeout { .. })
    }
}

impl From<sqlx::Error> for AgentError {
    fn from(err: sqlx::Error) -> Self {
        AgentError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Llm(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

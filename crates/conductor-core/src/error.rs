use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Classification of a failure, independent of its message.
///
/// The retry machinery only ever looks at the kind, never at the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed workflow or task input.
    Validation,
    /// No registered agent advertises the required capabilities.
    NoCapableAgent,
    /// A transient resource shortage (connection pool, quota, memory).
    Resource,
    /// The agent gave up waiting on something.
    Timeout,
    /// An agent-reported failure with no finer classification.
    AgentExecution,
    /// The run was cancelled before the work could be attempted again.
    Cancelled,
    /// Invalid engine configuration.
    Config,
    /// A bug in the engine itself.
    Internal,
}

impl ErrorKind {
    /// Kinds that can never be retried, regardless of policy.
    pub fn is_always_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::NoCapableAgent | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NoCapableAgent => "no_capable_agent",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentExecution => "agent_execution",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the conductor engine and its agents.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// The workflow specification or a task in it is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No live agent covers the task's required capabilities.
    #[error("No capable agent for task '{task_id}' (requires {required:?})")]
    NoCapableAgent {
        /// Task that could not be placed.
        task_id: String,
        /// Capabilities it asked for.
        required: Vec<String>,
    },

    /// A transient resource failure reported by an agent.
    #[error("Resource error: {0}")]
    Resource(String),

    /// An agent-side timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Wraps an agent-reported failure. `kind` carries the underlying
    /// classification when the agent knows it.
    #[error("Agent execution error: {message}")]
    AgentExecution {
        /// Underlying classification, if any.
        kind: Option<ErrorKind>,
        /// Agent-supplied description.
        message: String,
    },

    /// Work was abandoned because the run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid engine configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// An engine invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Shorthand for an [`ConductorError::AgentExecution`] with a known kind.
    pub fn agent(kind: ErrorKind, message: impl Into<String>) -> Self {
        ConductorError::AgentExecution {
            kind: Some(kind),
            message: message.into(),
        }
    }

    /// Shorthand for an unclassified [`ConductorError::AgentExecution`].
    pub fn agent_unclassified(message: impl Into<String>) -> Self {
        ConductorError::AgentExecution {
            kind: None,
            message: message.into(),
        }
    }

    /// The kind of this variant, as reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Validation(_) => ErrorKind::Validation,
            ConductorError::NoCapableAgent { .. } => ErrorKind::NoCapableAgent,
            ConductorError::Resource(_) => ErrorKind::Resource,
            ConductorError::Timeout(_) => ErrorKind::Timeout,
            ConductorError::AgentExecution { .. } => ErrorKind::AgentExecution,
            ConductorError::Cancelled(_) => ErrorKind::Cancelled,
            ConductorError::Config(_) => ErrorKind::Config,
            ConductorError::NotFound(_)
            | ConductorError::Internal(_)
            | ConductorError::Json(_)
            | ConductorError::Io(_) => ErrorKind::Internal,
        }
    }

    /// The kind used to decide whether a failed attempt may be retried.
    ///
    /// An agent execution error resolves to its underlying kind; without one
    /// it stays `AgentExecution`, which no default policy retries.
    pub fn retry_kind(&self) -> ErrorKind {
        match self {
            ConductorError::AgentExecution {
                kind: Some(inner), ..
            } => *inner,
            other => other.kind(),
        }
    }
}

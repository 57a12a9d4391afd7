use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::SessionStatus;

/// Core error type for Delve.
#[derive(Debug, Error)]
pub enum DelveError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("document {0} not found")]
    DocumentNotFound(Uuid),
    /// Continuation attempted on an ancestor that has not completed.
    #[error("cannot continue session {parent_id}: parent is {status}, expected completed")]
    InvalidParentState {
        parent_id: Uuid,
        status: SessionStatus,
    },
    #[error(transparent)]
    PricingNotFound(#[from] PricingNotFoundError),
    #[error(transparent)]
    AgentExecution(#[from] AgentExecutionError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DelveError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Raised when a run used a model the pricing table does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("no pricing configured for model `{model_name}`")]
pub struct PricingNotFoundError {
    pub model_name: String,
}

impl PricingNotFoundError {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

/// Failure surfaced by the external research capability.
///
/// Every variant carries the trace identifier assigned before the failure, if
/// any, so a failed session can still be correlated with external traces.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentExecutionError {
    #[error("agent transport failure: {message}")]
    Transport {
        message: String,
        trace_id: Option<String>,
    },
    #[error("agent returned HTTP {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        trace_id: Option<String>,
    },
    #[error("malformed agent output: {message}")]
    MalformedOutput {
        message: String,
        trace_id: Option<String>,
    },
    #[error("agent run timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        trace_id: Option<String>,
    },
}

impl AgentExecutionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            Self::Transport { trace_id, .. }
            | Self::Upstream { trace_id, .. }
            | Self::MalformedOutput { trace_id, .. }
            | Self::Timeout { trace_id, .. } => trace_id.as_deref(),
        }
    }

    /// Attach a trace id unless the error already carries one.
    pub fn with_fallback_trace_id(mut self, fallback: Option<String>) -> Self {
        let slot = match &mut self {
            Self::Transport { trace_id, .. }
            | Self::Upstream { trace_id, .. }
            | Self::MalformedOutput { trace_id, .. }
            | Self::Timeout { trace_id, .. } => trace_id,
        };
        if slot.is_none() {
            *slot = fallback;
        }
        self
    }

    /// Transient failures are worth another attempt; a malformed answer or a
    /// rejected request will not improve by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => *status >= 500 || *status == 429,
            Self::MalformedOutput { .. } => false,
        }
    }
}

/// Failures while turning an upload into context-ready text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DocumentError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),
    #[error("text extraction failed: {0}")]
    Extraction(String),
    #[error("summarization failed: {0}")]
    Summarization(String),
}

impl DocumentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Summarization(_))
    }
}

/// A state machine edge that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {entity} transition from {from} to {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Error representing a failed unit of scheduled work.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub reason: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::new(reason, true)
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::new(reason, false)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retry = if self.retryable {
            "retryable"
        } else {
            "terminal"
        };
        write!(f, "{retry} task failure: {}", self.reason)
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_follows_failure_kind() {
        assert!(AgentExecutionError::transport("connection reset").is_retryable());
        assert!(
            AgentExecutionError::Timeout {
                timeout_ms: 10,
                trace_id: None
            }
            .is_retryable()
        );
        assert!(
            AgentExecutionError::Upstream {
                status: 503,
                message: "busy".into(),
                trace_id: None
            }
            .is_retryable()
        );
        assert!(
            !AgentExecutionError::Upstream {
                status: 400,
                message: "bad input".into(),
                trace_id: None
            }
            .is_retryable()
        );
        assert!(!AgentExecutionError::malformed("no report").is_retryable());
    }

    #[test]
    fn fallback_trace_id_never_overrides_existing() {
        let err = AgentExecutionError::Transport {
            message: "reset".into(),
            trace_id: Some("engine-run".into()),
        }
        .with_fallback_trace_id(Some("local".into()));
        assert_eq!(err.trace_id(), Some("engine-run"));

        let err = AgentExecutionError::malformed("empty").with_fallback_trace_id(Some("local".into()));
        assert_eq!(err.trace_id(), Some("local"));
    }
}

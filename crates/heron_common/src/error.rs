use thiserror::Error;

use crate::types::NodeId;

/// Convenience alias for `Result<T, HeronError>`.
pub type HeronResult<T> = Result<T, HeronError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`  — bad input or a disallowed operation; requires operator
///   action, never retried automatically (4xx equivalent)
/// - `Retryable`  — the reporting node should re-synchronize and retry on its
///   own schedule (e.g. a rejected state transition)
/// - `Transient`  — a dependency timed out or an evaluation was incomplete;
///   hold current state and wait for the next tick, never retry within the
///   same evaluation
/// - `Fatal`      — fatal to availability (e.g. no eligible failover
///   candidate); surfaced loudly to operators, never silently ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    Fatal,
}

/// Top-level error type for the control plane.
#[derive(Error, Debug)]
pub enum HeronError {
    /// Duplicate host:port or system-identifier mismatch. Never
    /// auto-resolved; requires operator input.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),

    /// A proposed reported-state is not a legal successor of the node's
    /// current state. Recoverable: the node re-synchronizes and retries.
    #[error("illegal transition for node {node_id}: {from} -> {to}")]
    IllegalTransition {
        node_id: NodeId,
        from: String,
        to: String,
    },

    /// Disallowed destructive operation, e.g. removing an active primary
    /// without `force`.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A dependency (registry, consensus adapter, engine probe) was
    /// unreachable mid-evaluation. Callers hold current state and do
    /// nothing destructive.
    #[error("evaluation incomplete: {0}")]
    EvaluationIncomplete(String),

    /// No node qualifies for promotion. Fatal to availability but
    /// non-crashing; must reach operators.
    #[error("no eligible candidate: {0}")]
    NoEligibleCandidate(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HeronError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeronError::Conflict(_)
            | HeronError::NodeNotFound(_)
            | HeronError::ClusterNotFound(_)
            | HeronError::PreconditionFailed(_)
            | HeronError::Config(_) => ErrorKind::UserError,

            HeronError::IllegalTransition { .. } => ErrorKind::Retryable,

            HeronError::EvaluationIncomplete(_)
            | HeronError::Io(_)
            | HeronError::Consensus(_) => ErrorKind::Transient,

            HeronError::NoEligibleCandidate(_)
            | HeronError::Storage(_)
            | HeronError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the reporting node should retry this operation
    /// on its own schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this error must be surfaced to operators.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// HTTP status code for the control-plane API.
    pub fn http_status(&self) -> u16 {
        match self {
            HeronError::Conflict(_) => 409,
            HeronError::NodeNotFound(_) | HeronError::ClusterNotFound(_) => 404,
            HeronError::IllegalTransition { .. } => 409,
            HeronError::PreconditionFailed(_) => 412,
            HeronError::Config(_) => 400,
            HeronError::EvaluationIncomplete(_) | HeronError::NoEligibleCandidate(_) => 503,
            HeronError::Io(_)
            | HeronError::Consensus(_)
            | HeronError::Storage(_)
            | HeronError::Internal(_) => 500,
        }
    }

    /// Emit a structured log entry for Fatal errors. Must be called before a
    /// Fatal error is returned across the API boundary.
    pub fn log_if_fatal(&self) {
        if self.is_fatal() {
            tracing::error!(kind = ?self.kind(), "FATAL: {}", self);
        }
    }
}

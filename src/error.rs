//! Error taxonomy for the orchestration engine.
//!
//! Two families:
//! - [`OrderError`]: coded input-validation faults surfaced to API callers
//!   with a machine-readable code (`QUERY_REQUIRED`, `BAD_COOKIE`, ...).
//! - [`RunnerError`]: faults raised while advancing a script runner. The
//!   scheduler maps each kind onto a job state transition; nothing from this
//!   family is allowed to escape a tick.

use std::fmt;

/// Maximum length (in code points) of any persisted human message.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Truncate a message to [`MAX_MESSAGE_LEN`] code points.
pub fn clip_message(msg: &str) -> String {
    msg.chars().take(MAX_MESSAGE_LEN).collect()
}

/// Machine-readable codes for request-level faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderErrorCode {
    QueryNotAllowed,
    QueryRequired,
    TooManyParts,
    JobNotFound,
    WorkOrderNotFound,
    DrawingNotFound,
    InvalidResult,
    BadCookie,
    NotPauseable,
    NotPaused,
    NotErrored,
    NotQueued,
    RollbackFailed,
    BadCheckpoint,
    ScriptInvalid,
}

impl OrderErrorCode {
    /// Wire representation. Existing assembler clients match on these
    /// strings, so the `TO_MANY_PARTS` spelling is load-bearing.
    pub fn as_str(self) -> &'static str {
        match self {
            OrderErrorCode::QueryNotAllowed => "QUERY_NOT_ALLOWED",
            OrderErrorCode::QueryRequired => "QUERY_REQUIRED",
            OrderErrorCode::TooManyParts => "TO_MANY_PARTS",
            OrderErrorCode::JobNotFound => "JOB_NOT_FOUND",
            OrderErrorCode::WorkOrderNotFound => "WORKORDER_NOT_FOUND",
            OrderErrorCode::DrawingNotFound => "DRAWING_NOT_FOUND",
            OrderErrorCode::InvalidResult => "INVALID_RESULT",
            OrderErrorCode::BadCookie => "BAD_COOKIE",
            OrderErrorCode::NotPauseable => "NOT_PAUSEABLE",
            OrderErrorCode::NotPaused => "NOT_PAUSED",
            OrderErrorCode::NotErrored => "NOT_ERRORED",
            OrderErrorCode::NotQueued => "NOT_QUEUED",
            OrderErrorCode::RollbackFailed => "ROLLBACK_FAILED",
            OrderErrorCode::BadCheckpoint => "BAD_CHECKPOINT",
            OrderErrorCode::ScriptInvalid => "SCRIPT_INVALID",
        }
    }
}

impl fmt::Display for OrderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded domain fault, surfaced to API callers as `{code, message}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct OrderError {
    pub code: OrderErrorCode,
    pub message: String,
}

impl OrderError {
    pub fn new(code: OrderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Faults raised while advancing a [`crate::runner::Runner`].
///
/// The scheduler maps kinds onto job transitions: `Pause` -> paused,
/// `Execution` -> error (recoverable), everything else -> aborted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    /// Script requested an operator pause.
    #[error("paused: {0}")]
    Pause(String),

    /// Recoverable execution fault; the job can be reset or rolled back.
    #[error("execution error: {0}")]
    Execution(String),

    /// Terminal fault raised explicitly by the script or engine.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Invalid call-site arguments for an external function.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Reference to a name no module provides.
    #[error("not defined: {0}")]
    NotDefined(String),

    /// The compiled program is malformed.
    #[error("script error: {0}")]
    Script(String),

    /// Anything unexpected, wrapped with its fault kind and text so the
    /// tick boundary can classify it as terminal.
    #[error("internal fault ({kind}): {message}")]
    Internal { kind: String, message: String },
}

impl RunnerError {
    pub fn internal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RunnerError::Internal {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// True for faults that leave the job recoverable (`error` state).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RunnerError::Execution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_code_points() {
        let msg = "é".repeat(2000);
        let clipped = clip_message(&msg);
        assert_eq!(clipped.chars().count(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn codes_render_wire_spelling() {
        assert_eq!(OrderErrorCode::TooManyParts.as_str(), "TO_MANY_PARTS");
        assert_eq!(OrderErrorCode::NotPaused.as_str(), "NOT_PAUSED");
    }

    #[test]
    fn only_execution_is_recoverable() {
        assert!(RunnerError::Execution("x".into()).is_recoverable());
        assert!(!RunnerError::Parameter("x".into()).is_recoverable());
        assert!(!RunnerError::internal("Panic", "boom").is_recoverable());
    }
}

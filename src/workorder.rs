//! WorkOrder and Job records and their state machine.
//!
//! A WorkOrder fans out into one Job per matched part. Each Job carries its
//! runner checkpoint as an opaque blob; the scheduler is the only writer.
//! Guarded transitions fail with the coded errors API callers key on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{clip_message, OrderError, OrderErrorCode};

/// Upper bound on parts a single WorkOrder may target.
pub const MAX_TARGET_PARTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created, not yet released to the scheduler
    New,
    /// Released; picked up by the next tick
    Waiting,
    /// Actively ticked
    Queued,
    Done,
    /// Halted for an operator; resumable
    Paused,
    /// Recoverable fault; reset or rollback applies
    Error,
    Aborted,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Waiting => "waiting",
            JobState::Queued => "queued",
            JobState::Done => "done",
            JobState::Paused => "paused",
            JobState::Error => "error",
            JobState::Aborted => "aborted",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Aborted)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "waiting" => Ok(JobState::Waiting),
            "queued" => Ok(JobState::Queued),
            "done" => Ok(JobState::Done),
            "paused" => Ok(JobState::Paused),
            "error" => Ok(JobState::Error),
            "aborted" => Ok(JobState::Aborted),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// How a WorkOrder's jobs are released: all at once or one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStyle {
    Parallel,
    Serial,
}

impl ExecutionStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStyle::Parallel => "parallel",
            ExecutionStyle::Serial => "serial",
        }
    }
}

impl std::str::FromStr for ExecutionStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(ExecutionStyle::Parallel),
            "serial" => Ok(ExecutionStyle::Serial),
            other => Err(format!("unknown execution style '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: i64,
    pub user: String,
    pub drawing_id: i64,
    pub execution_style: ExecutionStyle,
    pub part_query: Option<String>,
    /// Opaque options exposed to scripts as `workorder.*`
    pub options: serde_json::Value,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkOrder {
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn set_message(&mut self, message: &str) {
        self.message = clip_message(message);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub workorder_id: i64,
    /// Identity of the part this job manufactures
    pub part: String,
    pub state: JobState,
    pub message: String,
    /// Serialized runner snapshot; opaque outside the scheduler
    pub checkpoint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn set_message(&mut self, message: &str) {
        self.message = clip_message(message);
    }

    /// Pause applies only while the job is still moving.
    pub fn ensure_pauseable(&self) -> Result<(), OrderError> {
        match self.state {
            JobState::Waiting | JobState::Queued => Ok(()),
            state => Err(OrderError::new(
                OrderErrorCode::NotPauseable,
                format!("job {} is {}, not pauseable", self.id, state),
            )),
        }
    }

    pub fn ensure_paused(&self) -> Result<(), OrderError> {
        match self.state {
            JobState::Paused => Ok(()),
            state => Err(OrderError::new(
                OrderErrorCode::NotPaused,
                format!("job {} is {}, not paused", self.id, state),
            )),
        }
    }

    /// Reset and rollback apply only to errored jobs.
    pub fn ensure_errored(&self) -> Result<(), OrderError> {
        match self.state {
            JobState::Error => Ok(()),
            state => Err(OrderError::new(
                OrderErrorCode::NotErrored,
                format!("job {} is {}, not errored", self.id, state),
            )),
        }
    }

    pub fn ensure_queued(&self) -> Result<(), OrderError> {
        match self.state {
            JobState::Queued => Ok(()),
            state => Err(OrderError::new(
                OrderErrorCode::NotQueued,
                format!("job {} is {}, not queued", self.id, state),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(state: JobState) -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            workorder_id: 1,
            part: "unit-7".to_string(),
            state,
            message: String::new(),
            checkpoint: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert!(!JobState::Error.is_terminal());
        assert!(!JobState::Paused.is_terminal());
    }

    #[test]
    fn guards_carry_their_codes() {
        let done = job(JobState::Done);
        assert_eq!(
            done.ensure_pauseable().unwrap_err().code,
            OrderErrorCode::NotPauseable
        );
        assert_eq!(
            done.ensure_paused().unwrap_err().code,
            OrderErrorCode::NotPaused
        );
        assert_eq!(
            done.ensure_errored().unwrap_err().code,
            OrderErrorCode::NotErrored
        );
        assert_eq!(
            done.ensure_queued().unwrap_err().code,
            OrderErrorCode::NotQueued
        );

        assert!(job(JobState::Queued).ensure_pauseable().is_ok());
        assert!(job(JobState::Paused).ensure_paused().is_ok());
        assert!(job(JobState::Error).ensure_errored().is_ok());
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobState::Waiting).unwrap(),
            "\"waiting\""
        );
        assert_eq!(JobState::Aborted.to_string(), "aborted");
    }

    #[test]
    fn messages_are_clipped_on_set() {
        let mut j = job(JobState::Queued);
        j.set_message(&"m".repeat(5000));
        assert_eq!(j.message.chars().count(), crate::error::MAX_MESSAGE_LEN);
    }
}

//! Analysis job model and its state machine.
//!
//! ```text
//! Queued → Ingesting → Indexing → Retrieving → Generating → Completed
//!    └──────────┴──────────┴───────────┴────────────┴──→ Failed
//! ```
//!
//! Transitions only move one step forward or to `Failed`, and nothing
//! leaves a terminal state. Every transition is appended to the job's
//! history with a timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use repo_lens_core::error::{ErrorKind, PipelineError};
use repo_lens_core::models::{RepositorySource, ResolvedSource};

use crate::generate::{Artifact, InstructionKind};

/// Who submitted a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    Anonymous { session: String },
    Account { id: String },
}

impl Actor {
    /// `session:<id>` or `account:<id>`.
    pub fn key(&self) -> String {
        match self {
            Actor::Anonymous { session } => format!("session:{}", session),
            Actor::Account { id } => format!("account:{}", id),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Actor::Anonymous { .. })
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Ingesting,
    Indexing,
    Retrieving,
    Generating,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Ingesting => "ingesting",
            JobState::Indexing => "indexing",
            JobState::Retrieving => "retrieving",
            JobState::Generating => "generating",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "ingesting" => Some(JobState::Ingesting),
            "indexing" => Some(JobState::Indexing),
            "retrieving" => Some(JobState::Retrieving),
            "generating" => Some(JobState::Generating),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// The next state on the success path.
    pub fn successor(&self) -> Option<JobState> {
        match self {
            JobState::Queued => Some(JobState::Ingesting),
            JobState::Ingesting => Some(JobState::Indexing),
            JobState::Indexing => Some(JobState::Retrieving),
            JobState::Retrieving => Some(JobState::Generating),
            JobState::Generating => Some(JobState::Completed),
            JobState::Completed | JobState::Failed => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// Terminal failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for JobError {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Counters surfaced while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub files_selected: usize,
    pub summary_chunks: usize,
    pub structural_chunks: usize,
    pub dropped_chunks: usize,
    pub reused_generation: bool,
    pub artifacts_done: usize,
}

/// One analysis request, end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub actor: Actor,
    pub source: RepositorySource,
    #[serde(default)]
    pub resolved: Option<ResolvedSource>,
    pub instructions: Vec<InstructionKind>,
    pub state: JobState,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub generation_id: Option<String>,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub progress: JobProgress,
}

impl AnalysisJob {
    /// A new job in `Queued`.
    pub fn new(actor: Actor, source: RepositorySource, instructions: Vec<InstructionKind>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor,
            source,
            resolved: None,
            instructions,
            state: JobState::Queued,
            history: vec![StateChange {
                state: JobState::Queued,
                at: now,
            }],
            created_at: now,
            updated_at: now,
            generation_id: None,
            error: None,
            artifacts: Vec::new(),
            progress: JobProgress::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`: the successor of the current state, or `Failed`
    /// from any non-terminal state.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        let allowed = !self.state.is_terminal()
            && (next == JobState::Failed || self.state.successor() == Some(next));
        if !allowed {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        self.history.push(StateChange { state: next, at: now });
        Ok(())
    }

    /// Record `error` and move to `Failed`.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> AnalysisJob {
        AnalysisJob::new(
            Actor::Anonymous {
                session: "s1".into(),
            },
            RepositorySource::parse("https://github.com/a/b", None),
            vec![InstructionKind::Documentation],
        )
    }

    #[test]
    fn actor_keys() {
        assert_eq!(Actor::Anonymous { session: "x".into() }.key(), "session:x");
        assert_eq!(Actor::Account { id: "7".into() }.key(), "account:7");
    }

    #[test]
    fn happy_path_records_history() {
        let mut job = job();
        for state in [
            JobState::Ingesting,
            JobState::Indexing,
            JobState::Retrieving,
            JobState::Generating,
            JobState::Completed,
        ] {
            job.transition(state).unwrap();
        }
        let states: Vec<_> = job.history.iter().map(|h| h.state).collect();
        assert_eq!(states.len(), 6);
        assert_eq!(states[0], JobState::Queued);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.updated_at >= job.created_at);
    }

    #[test]
    fn skips_are_rejected() {
        let mut job = job();
        let err = job.transition(JobState::Indexing).unwrap_err();
        assert_eq!(err.from, JobState::Queued);
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = job();
        job.transition(JobState::Ingesting).unwrap();
        job.fail(JobError {
            kind: ErrorKind::IngestionUnavailable,
            message: "clone failed".into(),
        })
        .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.transition(JobState::Indexing).is_err());
        assert!(job.transition(JobState::Failed).is_err());
        assert!(job
            .fail(JobError {
                kind: ErrorKind::Internal,
                message: "again".into()
            })
            .is_err());
        assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::IngestionUnavailable);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut job = job();
        job.transition(JobState::Ingesting).unwrap();
        let json = serde_json::to_string(&job).unwrap();
        let back: AnalysisJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert!(json.contains("\"state\":\"ingesting\""));
    }

    #[test]
    fn state_strings_parse() {
        for s in ["queued", "ingesting", "indexing", "retrieving", "generating", "completed", "failed"] {
            assert_eq!(JobState::parse(s).unwrap().as_str(), s);
        }
        assert!(JobState::parse("paused").is_none());
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A job as handed to the agent by the control plane.
///
/// The command to run, its environment, and the chunking parameters for
/// log shipping all arrive in the accept response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Upper bound on the raw (pre-compression) size of one log chunk.
    pub chunks_max_size_bytes: usize,
    /// Job-scoped auth token used for all per-job API calls.
    pub token: String,
}

/// Lifecycle state of the one job an agent may hold.
///
/// Transitions are monotonic: Assigned → Accepted → Running → Finished.
/// Canceled may occur from any pre-finished state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Assigned,
    Accepted,
    Running,
    /// Terminal.
    Finished,
    /// Terminal.
    Canceled,
}

/// A transition that would violate the monotonic job lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled)
    }

    /// Apply a single guarded transition.
    ///
    /// Returns the new state, or [`InvalidTransition`] if the step would
    /// skip a stage, move backwards, or leave a terminal state.
    pub fn advance(self, to: JobState) -> Result<JobState, InvalidTransition> {
        let ok = matches!(
            (self, to),
            (Self::Assigned, Self::Accepted)
                | (Self::Accepted, Self::Running)
                | (Self::Running, Self::Finished)
                | (Self::Assigned, Self::Canceled)
                | (Self::Accepted, Self::Canceled)
                | (Self::Running, Self::Canceled)
        );
        if ok {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Outcome reported to the control plane when a job finishes.
///
/// `exit_status` is a string on the wire; "-1" with a signal reason of
/// "agent-refused" marks a job the agent refused to start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub exit_status: String,
    pub signal_reason: Option<String>,
    pub chunks_failed_count: u64,
}

impl JobResult {
    /// Result for a process that ran to completion (or was killed).
    pub fn exited(status: i32, chunks_failed_count: u64) -> Self {
        Self {
            exit_status: status.to_string(),
            signal_reason: None,
            chunks_failed_count,
        }
    }

    /// Result for a job the agent refused on policy grounds.
    ///
    /// No bootstrap process was started.
    pub fn refused() -> Self {
        Self {
            exit_status: "-1".into(),
            signal_reason: Some("agent-refused".into()),
            chunks_failed_count: 0,
        }
    }
}

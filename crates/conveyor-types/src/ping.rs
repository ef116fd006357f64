use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to a job the control plane wants this agent to run.
///
/// Both signalling channels reduce to an id: the poll channel delivers a
/// full job object but the job body is re-fetched on accept, and the push
/// channel only ever carries the id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
}

impl JobRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A control-plane hint about what the agent should do next.
///
/// Produced by either ping source (poll or push stream). There is no
/// ordering across sources; within one source, events are delivered in
/// emission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingEvent {
    /// Nothing to do. Also used as the resume signal after a pause.
    Idle,
    /// Stop acquiring jobs until resumed. Heartbeats continue.
    Pause {
        reason: String,
        until: Option<DateTime<Utc>>,
    },
    /// The control plane asks this agent to shut down gracefully.
    Disconnect,
    /// A job has been assigned to this agent.
    JobAssigned(JobRef),
}

impl PingEvent {
    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Pause { .. } => "Pause",
            Self::Disconnect => "Disconnect",
            Self::JobAssigned(_) => "JobAssigned",
        }
    }

    /// Whether this event carries work (a job assignment).
    pub fn is_assignment(&self) -> bool {
        matches!(self, Self::JobAssigned(_))
    }
}

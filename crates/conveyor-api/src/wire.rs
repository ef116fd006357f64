use std::collections::BTreeMap;

use conveyor_types::{Job, JobRef, PingEvent};
use serde::{Deserialize, Serialize};

/// Identity and declared features sent at registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub script_eval_enabled: bool,
    pub ignore_in_dispatches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub version: String,
    pub build: String,
    #[serde(default)]
    pub meta_data: Vec<String>,
    pub pid: u32,
    pub machine_id: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// What the control plane issues in exchange: the access token and the
/// cadences for the poll, heartbeat, and job-status loops (seconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
    pub name: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, String>>,
    pub ping_interval: u64,
    pub job_status_interval: u64,
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub meta_data: Vec<String>,
}

/// A poll response. `job` present means a new assignment regardless of the
/// `action` string; `endpoint`/`request_headers` are runtime overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, String>>,
}

/// An action string neither side of the protocol knows.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown ping action: {0}")]
pub struct UnknownAction(pub String);

impl Ping {
    /// Translate the wire form into the internal event.
    pub fn event(&self) -> Result<PingEvent, UnknownAction> {
        if let Some(job) = &self.job {
            return Ok(PingEvent::JobAssigned(JobRef::new(&job.id)));
        }
        match self.action.as_deref() {
            None | Some("") | Some("idle") => Ok(PingEvent::Idle),
            Some("pause") => Ok(PingEvent::Pause {
                reason: self.message.clone().unwrap_or_default(),
                until: None,
            }),
            Some("disconnect") => Ok(PingEvent::Disconnect),
            Some(other) => Err(UnknownAction(other.to_string())),
        }
    }
}

/// One JSON payload from the SSE push stream's `data` field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseMessage {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl SseMessage {
    /// Translate the wire form into the internal event.
    pub fn event(&self) -> Result<PingEvent, UnknownAction> {
        match self.action.as_str() {
            "idle" => Ok(PingEvent::Idle),
            "pause" => Ok(PingEvent::Pause {
                reason: self.message.clone().unwrap_or_default(),
                until: None,
            }),
            "disconnect" => Ok(PingEvent::Disconnect),
            "job_assigned" => match &self.job_id {
                Some(id) => Ok(PingEvent::JobAssigned(JobRef::new(id))),
                None => Err(UnknownAction("job_assigned without job_id".into())),
            },
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub sent_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    pub received_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub started_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    pub finished_at: String,
    pub exit_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_reason: Option<String>,
    pub chunks_failed_count: u64,
}

/// Header timings keyed by line index, RFC 3339 with nanoseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTimesRequest {
    pub header_times: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateResponse {
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub note: String,
    pub timeout_in_minutes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub force: bool,
}

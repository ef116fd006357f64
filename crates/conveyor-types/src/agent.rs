use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

/// Everything an agent needs to know about itself before registration.
///
/// Built from CLI flags and their `BUILDKITE_*` environment mirrors.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Registration token exchanged for an access token on register.
    pub token: String,
    pub name: String,
    /// Free-form `key=value` tags advertised as meta-data.
    pub tags: Vec<String>,
    pub priority: Option<String>,
    /// Where to register; registration and pings may override it later.
    pub endpoint: Url,
    /// Extra request headers from `BUILDKITE_REQUEST_HEADER_*`.
    pub request_headers: BTreeMap<String, String>,
    pub build_path: PathBuf,
    pub hooks_path: Option<PathBuf>,
    pub plugins_path: Option<PathBuf>,
    pub sockets_path: Option<PathBuf>,
    /// How long a cancelled job may keep running before SIGKILL.
    pub cancel_grace_period: Duration,
    /// How long Finish may keep retrying before a forced report.
    pub signal_grace_period: Duration,
    /// Run exactly this job, then exit.
    pub acquire_job: Option<String>,
    pub disconnect_after_job: bool,
    pub disconnect_after_idle_timeout: Option<Duration>,
    /// Anchored patterns a job env var name must match to be passed through.
    /// Empty means no restriction.
    pub allowed_env: Vec<String>,
    /// Number of parallel workers sharing one idle monitor.
    pub spawn: usize,
    /// Whether the SSE push stream may be used alongside polling.
    pub ping_stream_enabled: bool,
    pub debug: bool,
}

/// What the control plane told us at registration.
///
/// The access token replaces the registration token for all later calls;
/// the intervals drive the poll, heartbeat, and job-status loops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredAgent {
    pub id: String,
    pub name: String,
    pub access_token: String,
    pub ping_interval: Duration,
    pub heartbeat_interval: Duration,
    pub job_status_interval: Duration,
}

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_api::wire::{FinishRequest, HeaderTimesRequest, StartRequest};
use conveyor_api::{ControlPlane, RetryPolicy, with_retries};
use conveyor_types::{
    AgentConfig, ErrorKind, Job, JobRef, JobResult, JobState, RegisteredAgent,
};
use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HeaderScanner, LogStreamer, rfc3339_nanos};
use crate::bootstrap::{Bootstrap, BootstrapProcess, CommandSpec};
use crate::recv_once;

/// How long `stop` may spend draining outstanding log uploads.
const STREAM_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// What a finished (or refused, or canceled) job reported upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub result: JobResult,
    pub state: JobState,
}

/// Drives one job through accept → start → supervise → finish.
///
/// Exactly one controller exists per worker at a time; the dispatcher
/// enforces that before constructing one.
pub struct JobController {
    api: Arc<dyn ControlPlane>,
    bootstrap: Arc<dyn Bootstrap>,
    config: Arc<AgentConfig>,
    registered: RegisteredAgent,
    /// Graceful cancel: SIGTERM, then SIGKILL after the grace period.
    cancel: CancellationToken,
    /// Forceful stop: SIGKILL the process group immediately.
    force: CancellationToken,
}

impl JobController {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        bootstrap: Arc<dyn Bootstrap>,
        config: Arc<AgentConfig>,
        registered: RegisteredAgent,
        cancel: CancellationToken,
        force: CancellationToken,
    ) -> Self {
        Self {
            api,
            bootstrap,
            config,
            registered,
            cancel,
            force,
        }
    }

    /// Returns `None` when the job was abandoned at accept (someone else
    /// got it); otherwise the reported outcome.
    pub async fn run(self, job_ref: JobRef) -> Option<JobOutcome> {
        let job = self.accept(&job_ref).await?;
        Some(self.execute(job).await)
    }

    /// Run a job obtained through acquire; the acquire response already
    /// plays the role of the accept response.
    pub async fn run_acquired(self, job: Job) -> JobOutcome {
        self.execute(job).await
    }

    async fn accept(&self, job_ref: &JobRef) -> Option<Job> {
        let attempt = with_retries("job accept", RetryPolicy::job_call(), &self.cancel, |_| {
            self.api.accept_job(&job_ref.id)
        })
        .await;
        match attempt {
            Ok(job) => Some(job),
            Err(err) if err.kind() == ErrorKind::TerminalStatus => {
                info!(job = %job_ref.id, %err, "job accept conflicted, abandoning");
                None
            }
            Err(err) => {
                warn!(job = %job_ref.id, %err, "job accept failed, abandoning");
                None
            }
        }
    }

    async fn execute(self, job: Job) -> JobOutcome {
        let state = JobState::Accepted;

        if let Err(err) = validate_env(&job.env, &self.config.allowed_env) {
            warn!(job = %job.id, "failed to validate environment variables: {err}");
            let result = JobResult::refused();
            self.report_finish(&job, &result).await;
            return JobOutcome {
                job_id: job.id,
                result,
                state: step(state, JobState::Canceled),
            };
        }

        let start_req = StartRequest {
            started_at: rfc3339_nanos(Utc::now()),
        };
        let started = with_retries("job start", RetryPolicy::job_call(), &self.cancel, |_| {
            self.api.start_job(&job, &start_req)
        })
        .await;
        if let Err(err) = started {
            error!(job = %job.id, %err, "could not report job start");
            let result = JobResult::exited(-1, 0);
            self.report_finish(&job, &result).await;
            return JobOutcome {
                job_id: job.id,
                result,
                state: step(state, JobState::Canceled),
            };
        }
        let state = step(state, JobState::Running);

        let spec = CommandSpec {
            env: self.bootstrap_env(&job),
            working_dir: self.working_dir(&job),
        };
        let process = match self.bootstrap.spawn(spec).await {
            Ok(process) => process,
            Err(err) => {
                error!(job = %job.id, %err, "bootstrap failed to start");
                let result = JobResult::exited(-1, 0);
                self.report_finish(&job, &result).await;
                return JobOutcome {
                    job_id: job.id,
                    result,
                    state: step(state, JobState::Canceled),
                };
            }
        };

        let run = self.supervise(&job, process).await;

        if !run.header_times.is_empty() {
            let req = HeaderTimesRequest {
                header_times: run
                    .header_times
                    .into_iter()
                    .map(|(index, stamp)| (index.to_string(), stamp))
                    .collect(),
            };
            let uploaded = with_retries(
                "header times upload",
                RetryPolicy::job_call(),
                &CancellationToken::new(),
                |_| self.api.upload_header_times(&job, &req),
            )
            .await;
            if let Err(err) = uploaded {
                warn!(job = %job.id, %err, "header times lost");
            }
        }

        let result = JobResult::exited(run.exit_status, run.chunks_failed);
        self.report_finish(&job, &result).await;
        let final_state = step(
            state,
            if run.canceled {
                JobState::Canceled
            } else {
                JobState::Finished
            },
        );
        JobOutcome {
            job_id: job.id,
            result,
            state: final_state,
        }
    }

    /// Pump output into the log streamer and header scanner while watching
    /// for exit, server-side cancellation, and agent shutdown.
    async fn supervise(&self, job: &Job, mut process: BootstrapProcess) -> RunResult {
        let mut streamer = LogStreamer::start(self.api.clone(), job.clone());
        let mut scanner = HeaderScanner::new();

        let watch_cancel = CancellationToken::new();
        let (server_cancel_tx, server_cancel_rx) = oneshot::channel();
        tokio::spawn(cancel_watch(
            self.api.clone(),
            job.clone(),
            self.registered.job_status_interval,
            watch_cancel.clone(),
            server_cancel_tx,
        ));
        let mut server_cancel = Some(server_cancel_rx);

        let mut exit_slot = Some(process.exit);
        let mut exit: Option<i32> = None;
        let mut output_done = false;
        let mut canceled = false;
        let mut forced = false;
        let mut kill_at: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                chunk = process.output.recv(), if !output_done => match chunk {
                    Some(bytes) => {
                        scanner.scan(&bytes);
                        if let Err(err) = streamer.append(&bytes).await {
                            warn!(%err, "dropping log bytes");
                        }
                    }
                    None => output_done = true,
                },
                code = recv_once(&mut exit_slot) => {
                    exit = Some(code.unwrap_or(-1));
                }
                fired = recv_once(&mut server_cancel), if exit.is_none() && !canceled => {
                    if fired.is_some() {
                        info!(job = %job.id, "job canceled by the control plane");
                        canceled = true;
                        process.control.terminate();
                        kill_at = Some(Box::pin(tokio::time::sleep(self.config.cancel_grace_period)));
                    }
                }
                _ = self.cancel.cancelled(), if exit.is_none() && !canceled => {
                    info!(job = %job.id, "canceling job for agent shutdown");
                    canceled = true;
                    process.control.terminate();
                    kill_at = Some(Box::pin(tokio::time::sleep(self.config.cancel_grace_period)));
                }
                _ = self.force.cancelled(), if exit.is_none() && !forced => {
                    warn!(job = %job.id, "force stop, killing the process group");
                    canceled = true;
                    forced = true;
                    kill_at = None;
                    process.control.kill();
                }
                _ = sleep_opt(&mut kill_at), if exit.is_none() => {
                    warn!(job = %job.id, "grace period elapsed, killing the process group");
                    process.control.kill();
                    kill_at = None;
                }
            }
            if exit.is_some() && output_done {
                break;
            }
        }
        watch_cancel.cancel();

        let header_times = scanner.finish();
        let chunks_failed = streamer.stop(STREAM_DRAIN_DEADLINE).await;
        RunResult {
            exit_status: exit.unwrap_or(-1),
            chunks_failed,
            header_times,
            canceled,
        }
    }

    /// Finish must land eventually: retry until the signal-grace deadline,
    /// then make one forced report.
    async fn report_finish(&self, job: &Job, result: &JobResult) {
        let req = FinishRequest {
            finished_at: rfc3339_nanos(Utc::now()),
            exit_status: result.exit_status.clone(),
            signal_reason: result.signal_reason.clone(),
            chunks_failed_count: result.chunks_failed_count,
        };
        let policy = RetryPolicy {
            backoff: conveyor_api::Backoff::Exponential {
                start: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
            max_attempts: None,
        };
        let attempt = tokio::time::timeout(
            self.config.signal_grace_period,
            with_retries("job finish", policy, &CancellationToken::new(), |_| {
                self.api.finish_job(job, &req)
            }),
        )
        .await;
        match attempt {
            Ok(Ok(())) => debug!(job = %job.id, exit_status = %req.exit_status, "job finished"),
            Ok(Err(err)) => error!(job = %job.id, %err, "job finish failed terminally"),
            Err(_) => {
                warn!(job = %job.id, "finish not acknowledged in time, forcing a final report");
                if let Err(err) = self.api.finish_job(job, &req).await {
                    error!(job = %job.id, %err, "forced finish report failed");
                }
            }
        }
    }

    fn bootstrap_env(&self, job: &Job) -> HashMap<String, String> {
        let mut env = job.env.clone();
        env.insert("BUILDKITE_JOB_ID".into(), job.id.clone());
        env.insert("BUILDKITE_AGENT_ID".into(), self.registered.id.clone());
        env.insert("BUILDKITE_AGENT_NAME".into(), self.registered.name.clone());
        env.insert("BUILDKITE_AGENT_ACCESS_TOKEN".into(), job.token.clone());
        env.insert(
            "BUILDKITE_BUILD_PATH".into(),
            self.config.build_path.display().to_string(),
        );
        if let Some(path) = &self.config.hooks_path {
            env.insert("BUILDKITE_HOOKS_PATH".into(), path.display().to_string());
        }
        if let Some(path) = &self.config.plugins_path {
            env.insert("BUILDKITE_PLUGINS_PATH".into(), path.display().to_string());
        }
        if let Some(path) = &self.config.sockets_path {
            env.insert("BUILDKITE_SOCKETS_PATH".into(), path.display().to_string());
        }
        if let Ok(path) = std::env::var("PATH") {
            env.entry("PATH".into()).or_insert(path);
        }
        env
    }

    fn working_dir(&self, job: &Job) -> std::path::PathBuf {
        let slug = job
            .env
            .get("BUILDKITE_PIPELINE_SLUG")
            .map(String::as_str)
            .unwrap_or("default");
        self.config
            .build_path
            .join(path_segment(&self.registered.name))
            .join(path_segment(slug))
    }
}

struct RunResult {
    exit_status: i32,
    chunks_failed: u64,
    header_times: BTreeMap<usize, String>,
    canceled: bool,
}

/// Advance the lifecycle, treating a rejected transition as a bug rather
/// than a runtime failure.
fn step(from: JobState, to: JobState) -> JobState {
    match from.advance(to) {
        Ok(next) => next,
        Err(err) => {
            debug_assert!(false, "{err}");
            to
        }
    }
}

/// Reduce a name to something safe to use as a directory segment.
fn path_segment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// The job env must satisfy the configured allowlist patterns.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvValidationError {
    #[error("allowlist pattern {pattern:?} does not compile: {detail}")]
    BadPattern { pattern: String, detail: String },
    #[error("variables not covered by the allowlist: {}", .names.join(", "))]
    Refused { names: Vec<String> },
}

/// Check every job env var name against the allowlist. An empty allowlist
/// means no restriction.
pub fn validate_env(
    env: &HashMap<String, String>,
    allowed: &[String],
) -> Result<(), EnvValidationError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let patterns = allowed
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| EnvValidationError::BadPattern {
                pattern: pattern.clone(),
                detail: err.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut refused: Vec<String> = env
        .keys()
        .filter(|name| !patterns.iter().any(|p| p.is_match(name)))
        .cloned()
        .collect();
    if refused.is_empty() {
        Ok(())
    } else {
        refused.sort();
        Err(EnvValidationError::Refused { names: refused })
    }
}

/// Poll the control plane for a cancel request; fires the notifier once
/// if the job is observed canceled.
async fn cancel_watch(
    api: Arc<dyn ControlPlane>,
    job: Job,
    interval: Duration,
    cancel: CancellationToken,
    notify: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match api.job_state(&job).await {
            Ok(resp) if resp.state == "canceled" => {
                let _ = notify.send(());
                return;
            }
            Ok(_) => {}
            Err(err) => debug!(job = %job.id, %err, "job state refresh failed"),
        }
    }
}

async fn sleep_opt(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

use std::sync::Arc;
use std::time::Duration;

use conveyor_api::{Backoff, ControlPlane};
use conveyor_types::{AgentConfig, AgentError, EndpointState, ErrorKind, Job};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::Bootstrap;
use crate::connection::ConnectionManager;
use crate::coordinator::{Baton, Coordinator};
use crate::dispatcher::{Dispatcher, StopCause};
use crate::idle::IdleMonitor;
use crate::job::controller::JobController;
use crate::ping::{PollSource, StreamSource};
use crate::signals::StopKind;

/// One agent: registration, its ping loops, and one job at a time.
pub struct Worker {
    pub index: usize,
    pub api: Arc<dyn ControlPlane>,
    pub bootstrap: Arc<dyn Bootstrap>,
    pub config: Arc<AgentConfig>,
    pub endpoint: Arc<EndpointState>,
    pub idle: Arc<IdleMonitor>,
    pub stop_rx: watch::Receiver<Option<StopKind>>,
    pub cancel: CancellationToken,
}

impl Worker {
    pub async fn run(self) -> Result<(), AgentError> {
        let conn = Arc::new(ConnectionManager::new(
            self.api.clone(),
            self.endpoint.clone(),
            self.config.clone(),
        ));
        let registered = conn.register(&self.cancel).await?;
        conn.connect(&self.cancel).await?;

        // Everything spawned below dies with this token.
        let loops = self.cancel.child_token();
        let heartbeat_conn = conn.clone();
        let heartbeat_cancel = loops.clone();
        let heartbeat_interval = registered.heartbeat_interval;
        tokio::spawn(async move {
            heartbeat_conn
                .heartbeat_loop(heartbeat_interval, heartbeat_cancel)
                .await;
        });

        let result = if let Some(job_id) = self.config.acquire_job.clone() {
            self.run_acquired(&registered, job_id).await
        } else {
            self.run_dispatch(&conn, &registered, &loops).await
        };

        loops.cancel();
        conn.disconnect().await;
        result
    }

    /// Normal operation: dual ping sources feeding the dispatcher.
    async fn run_dispatch(
        &self,
        conn: &Arc<ConnectionManager>,
        registered: &conveyor_types::RegisteredAgent,
        loops: &CancellationToken,
    ) -> Result<(), AgentError> {
        let (override_tx, override_rx) = mpsc::channel(8);
        let overrides_conn = conn.clone();
        let overrides_cancel = loops.clone();
        tokio::spawn(async move {
            overrides_conn
                .overrides_loop(override_rx, overrides_cancel)
                .await;
        });

        let baton = Baton::new();
        let (actions_tx, actions_rx) = mpsc::channel(1);

        if self.config.ping_stream_enabled {
            let (updates_tx, updates_rx) = mpsc::channel(16);
            let stream = StreamSource::new(
                self.api.clone(),
                registered.id.clone(),
                updates_tx,
                override_tx.clone(),
            );
            tokio::spawn(stream.run(loops.clone()));
            let coordinator =
                Coordinator::new(baton.clone(), updates_rx, actions_tx.clone(), loops.clone());
            tokio::spawn(coordinator.run());
        }

        let poll = PollSource::new(self.api.clone(), override_tx, registered.ping_interval);
        tokio::spawn(poll.run(baton, actions_tx, loops.clone()));

        let dispatcher = Dispatcher::new(
            actions_rx,
            self.api.clone(),
            self.bootstrap.clone(),
            self.config.clone(),
            registered.clone(),
            self.idle.clone(),
            self.index,
            self.stop_rx.clone(),
            loops.clone(),
        );
        let cause = dispatcher.run().await;
        info!(?cause, "worker stopping");
        if cause == StopCause::Signal(StopKind::Forceful) {
            warn!("stopped forcefully");
        }
        Ok(())
    }

    /// Acquire-specific-job mode: obtain exactly this job (waiting out 423
    /// lock responses, honoring Retry-After), run it, then exit.
    async fn run_acquired(
        &self,
        registered: &conveyor_types::RegisteredAgent,
        job_id: String,
    ) -> Result<(), AgentError> {
        let job = self.acquire(&job_id).await?;
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let controller = JobController::new(
            self.api.clone(),
            self.bootstrap.clone(),
            self.config.clone(),
            registered.clone(),
            cancel.clone(),
            force.clone(),
        );

        let mut stop_rx = self.stop_rx.clone();
        let mut run = tokio::spawn(controller.run_acquired(job));
        loop {
            tokio::select! {
                outcome = &mut run => {
                    match outcome {
                        Ok(outcome) => info!(
                            job = %outcome.job_id,
                            exit_status = %outcome.result.exit_status,
                            "acquired job complete"
                        ),
                        Err(err) => error!(%err, "acquired job task failed"),
                    }
                    return Ok(());
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        cancel.cancel();
                        continue;
                    }
                    match *stop_rx.borrow_and_update() {
                        Some(StopKind::Forceful) => force.cancel(),
                        Some(_) => cancel.cancel(),
                        None => {}
                    }
                }
            }
        }
    }

    async fn acquire(&self, job_id: &str) -> Result<Job, AgentError> {
        let backoff = Backoff::Exponential {
            start: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        };
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::cancelled("acquire interrupted"));
            }
            let err = match self.api.acquire_job(job_id).await {
                Ok(job) => return Ok(job),
                Err(err) => err,
            };
            // 423: the job is not yet available to us; wait as instructed.
            let locked = err.status().map(|s| s.as_u16()) == Some(423);
            if !locked && !err.is_retryable() {
                return Err(AgentError::new(ErrorKind::Fatal, "could not acquire job")
                    .with_detail(err.to_string()));
            }
            let delay = err.retry_after().unwrap_or_else(|| backoff.delay(attempt));
            warn!(%err, job = job_id, ?delay, "job not acquirable yet");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::cancelled("acquire interrupted")),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

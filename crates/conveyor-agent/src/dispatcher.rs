use std::sync::Arc;
use std::time::Duration;

use conveyor_types::{AgentConfig, PingEvent, RegisteredAgent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootstrap::Bootstrap;
use crate::coordinator::ActionMessage;
use crate::idle::IdleMonitor;
use crate::job::controller::{JobController, JobOutcome};
use crate::signals::StopKind;
use conveyor_api::ControlPlane;

/// Why the dispatcher stopped consuming actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    /// The control plane sent a disconnect action.
    Disconnect,
    /// disconnect-after-job: the one job this worker ran has finished.
    AfterJob,
    /// The whole pool sat idle past the configured timeout.
    IdleTimeout,
    /// An operator signal.
    Signal(StopKind),
    /// Every ping source is gone; nothing can arrive anymore.
    SourcesClosed,
    Cancelled,
}

struct RunningJob {
    handle: JoinHandle<Option<JobOutcome>>,
    cancel: CancellationToken,
    force: CancellationToken,
}

/// Single-threaded consumer of [`ActionMessage`]s.
///
/// All worker-wide mutable state (the current job, the paused flag) lives
/// here, confined to one task. The at-most-one-job invariant is enforced
/// at the `JobAssigned` branch: an assignment while a job is running is
/// dropped, and the next ping re-delivers it if it is still ours.
pub struct Dispatcher {
    actions: mpsc::Receiver<ActionMessage>,
    api: Arc<dyn ControlPlane>,
    bootstrap: Arc<dyn Bootstrap>,
    config: Arc<AgentConfig>,
    registered: RegisteredAgent,
    idle: Arc<IdleMonitor>,
    worker_index: usize,
    stop_rx: watch::Receiver<Option<StopKind>>,
    cancel: CancellationToken,
    paused: bool,
    running: Option<RunningJob>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actions: mpsc::Receiver<ActionMessage>,
        api: Arc<dyn ControlPlane>,
        bootstrap: Arc<dyn Bootstrap>,
        config: Arc<AgentConfig>,
        registered: RegisteredAgent,
        idle: Arc<IdleMonitor>,
        worker_index: usize,
        stop_rx: watch::Receiver<Option<StopKind>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            actions,
            api,
            bootstrap,
            config,
            registered,
            idle,
            worker_index,
            stop_rx,
            cancel,
            paused: false,
            running: None,
        }
    }

    pub async fn run(mut self) -> StopCause {
        self.idle.set_idle(self.worker_index);
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.actions.recv() => {
                    let Some(ActionMessage { event, done }) = msg else {
                        self.drain_job(StopKind::Graceful).await;
                        return StopCause::SourcesClosed;
                    };
                    let disconnect = self.handle(event);
                    let _ = done.send(());
                    if disconnect {
                        self.drain_job(StopKind::Graceful).await;
                        return StopCause::Disconnect;
                    }
                }
                outcome = job_done(&mut self.running) => {
                    self.running = None;
                    self.idle.set_idle(self.worker_index);
                    match outcome {
                        Some(Some(outcome)) => {
                            info!(
                                job = %outcome.job_id,
                                exit_status = %outcome.result.exit_status,
                                state = ?outcome.state,
                                "job complete"
                            );
                        }
                        Some(None) => debug!("job abandoned at accept"),
                        None => error!("job task failed"),
                    }
                    if self.config.disconnect_after_job {
                        return StopCause::AfterJob;
                    }
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        self.drain_job(StopKind::Graceful).await;
                        return StopCause::Cancelled;
                    }
                    let Some(kind) = *self.stop_rx.borrow_and_update() else { continue };
                    self.drain_job(kind).await;
                    return StopCause::Signal(kind);
                }
                _ = idle_check.tick() => {
                    if let Some(timeout) = self.config.disconnect_after_idle_timeout
                        && self.running.is_none()
                        && self.idle.all_idle_for().is_some_and(|idle| idle >= timeout)
                    {
                        info!(?timeout, "idle timeout reached");
                        return StopCause::IdleTimeout;
                    }
                }
                _ = self.cancel.cancelled() => {
                    self.drain_job(StopKind::Graceful).await;
                    return StopCause::Cancelled;
                }
            }
        }
    }

    /// Returns true when the action asks this worker to disconnect.
    fn handle(&mut self, event: PingEvent) -> bool {
        match event {
            PingEvent::Idle => {
                if self.paused {
                    info!("resumed");
                    self.paused = false;
                }
                if self.running.is_none() {
                    self.idle.set_idle(self.worker_index);
                }
            }
            PingEvent::Pause { reason, until } => {
                info!(reason, ?until, "paused, job acquisition suspended");
                self.paused = true;
            }
            PingEvent::Disconnect => {
                info!("control plane requested disconnect");
                return true;
            }
            PingEvent::JobAssigned(job_ref) => {
                if self.paused {
                    debug!(job = %job_ref.id, "paused, dropping assignment");
                } else if self.running.is_some() {
                    debug!(job = %job_ref.id, "already executing a job, dropping assignment");
                } else {
                    self.idle.set_busy(self.worker_index);
                    let cancel = CancellationToken::new();
                    let force = CancellationToken::new();
                    let controller = JobController::new(
                        self.api.clone(),
                        self.bootstrap.clone(),
                        self.config.clone(),
                        self.registered.clone(),
                        cancel.clone(),
                        force.clone(),
                    );
                    let handle = tokio::spawn(controller.run(job_ref));
                    self.running = Some(RunningJob {
                        handle,
                        cancel,
                        force,
                    });
                }
            }
        }
        false
    }

    /// Stop the running job (if any) and wait for its finish report.
    ///
    /// A further escalation signal arriving mid-drain upgrades the kill.
    async fn drain_job(&mut self, kind: StopKind) {
        let Some(mut job) = self.running.take() else {
            return;
        };
        match kind {
            StopKind::Graceful | StopKind::Quit => job.cancel.cancel(),
            StopKind::Forceful => job.force.cancel(),
        }
        loop {
            tokio::select! {
                outcome = &mut job.handle => {
                    match outcome {
                        Ok(Some(outcome)) => {
                            info!(job = %outcome.job_id, exit_status = %outcome.result.exit_status, "job stopped")
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, "job task failed during shutdown"),
                    }
                    return;
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_ok()
                        && matches!(*self.stop_rx.borrow_and_update(), Some(StopKind::Forceful))
                    {
                        warn!("escalating to a forceful stop");
                        job.force.cancel();
                    }
                }
            }
        }
    }
}

/// Await the running job's completion; pend when no job is running.
async fn job_done(running: &mut Option<RunningJob>) -> Option<Option<JobOutcome>> {
    match running.as_mut() {
        Some(job) => (&mut job.handle).await.ok(),
        None => std::future::pending().await,
    }
}

use std::sync::Arc;
use std::time::Duration;

use conveyor_api::{ApiError, ControlPlane};
use conveyor_types::{ErrorKind, PingEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::OverrideRequest;
use crate::coordinator::{ActionMessage, Baton};

/// How a single poll attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Network or retryable-status failure; try again next tick.
    #[error("ping failed: {0}")]
    Recoverable(#[source] ApiError),
    /// The control plane rejected us outright (4xx).
    #[error("ping rejected: {0}")]
    Unhealthy(#[source] ApiError),
}

/// The periodic ping source.
///
/// The first call fires immediately; after that each tick waits the
/// interval plus a uniform random jitter in [0, interval) so a fleet of
/// agents does not hammer the control plane in lockstep.
pub struct PollSource {
    api: Arc<dyn ControlPlane>,
    overrides: mpsc::Sender<OverrideRequest>,
    interval: Duration,
    first: bool,
}

impl PollSource {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        overrides: mpsc::Sender<OverrideRequest>,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            overrides,
            interval: interval.max(Duration::from_secs(1)),
            first: true,
        }
    }

    /// Wait for the next tick and ping. `None` means cancelled.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<PingEvent, PollError>> {
        if !self.first {
            let jitter = self.interval.mul_f64(rand::random::<f64>());
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.interval + jitter) => {}
            }
        }
        self.first = false;

        let ping = tokio::select! {
            _ = cancel.cancelled() => return None,
            ping = self.api.ping() => ping,
        };
        match ping {
            Ok(ping) => {
                if let Some(req) = OverrideRequest::from_ping(&ping) {
                    let _ = self.overrides.send(req).await;
                }
                match ping.event() {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        warn!(%err, "ignoring ping with unknown action");
                        Some(Ok(PingEvent::Idle))
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::TerminalStatus => {
                Some(Err(PollError::Unhealthy(err)))
            }
            Err(err) => Some(Err(PollError::Recoverable(err))),
        }
    }

    /// Drive the dispatcher: one event per tick, and only when the push
    /// stream is not holding the baton.
    pub async fn run(
        mut self,
        baton: Baton,
        actions: mpsc::Sender<ActionMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = match self.next(&cancel).await {
                None => return,
                Some(Ok(event)) => event,
                Some(Err(PollError::Recoverable(err))) => {
                    warn!(%err, "ping failed, will retry next tick");
                    continue;
                }
                Some(Err(PollError::Unhealthy(err))) => {
                    error!(%err, "ping rejected by the control plane");
                    continue;
                }
            };
            let Some(permit) = baton.try_acquire() else {
                debug!(event = event.name(), "stream is driving, dropping poll event");
                continue;
            };
            let (msg, done) = ActionMessage::new(event);
            if actions.send(msg).await.is_err() {
                return;
            }
            let _ = done.await;
            drop(permit);
        }
    }
}

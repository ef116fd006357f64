use std::sync::Arc;

use conveyor_types::PingEvent;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::recv_once;

/// Single-holder token deciding which ping source may emit actions.
///
/// The push stream holds it while healthy; the poll source grabs it per
/// tick when it is free. Holding the baton across an action's lifetime is
/// what makes "at most one action in flight" hold without further locks.
#[derive(Clone, Debug)]
pub struct Baton {
    inner: Arc<Semaphore>,
}

impl Default for Baton {
    fn default() -> Self {
        Self::new()
    }
}

impl Baton {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until the baton is free and take it.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        match self.inner.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => std::future::pending().await,
        }
    }

    /// Take the baton only if it is free right now.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.clone().try_acquire_owned().ok()
    }
}

/// One action on its way to the dispatcher, with the notifier the
/// dispatcher fires when it has finished handling it.
#[derive(Debug)]
pub struct ActionMessage {
    pub event: PingEvent,
    pub done: oneshot::Sender<()>,
}

impl ActionMessage {
    pub fn new(event: PingEvent) -> (Self, oneshot::Receiver<()>) {
        let (done, done_rx) = oneshot::channel();
        (Self { event, done }, done_rx)
    }
}

/// What the push stream source reports to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamUpdate {
    /// A connection is established; the stream should drive actions.
    HealthUp,
    /// The stream has given up; polling takes over.
    HealthDown,
    Event(PingEvent),
}

/// Debounces the push stream into the dispatcher.
///
/// Polling produces one action per tick by design; streaming can produce
/// arbitrary bursts. Bursts collapse into a single `pending` slot so only
/// the most recent event is forwarded once the in-flight action (if any)
/// completes. While the stream is healthy the coordinator holds the baton
/// and the poll source's events are discarded at the source.
pub struct Coordinator {
    baton: Baton,
    updates: mpsc::Receiver<StreamUpdate>,
    actions: mpsc::Sender<ActionMessage>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        baton: Baton,
        updates: mpsc::Receiver<StreamUpdate>,
        actions: mpsc::Sender<ActionMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            baton,
            updates,
            actions,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut held: Option<OwnedSemaphorePermit> = None;
        let mut pending: Option<PingEvent> = None;
        let mut in_flight: Option<oneshot::Receiver<()>> = None;
        let mut healthy = false;

        loop {
            tokio::select! {
                permit = self.baton.acquire(), if healthy && held.is_none() => {
                    held = Some(permit);
                    if in_flight.is_none()
                        && let Some(event) = pending.take()
                    {
                        match self.dispatch(event).await {
                            Some(done) => in_flight = Some(done),
                            None => break,
                        }
                    }
                }
                update = self.updates.recv() => match update {
                    None => break,
                    Some(StreamUpdate::HealthUp) => healthy = true,
                    Some(StreamUpdate::HealthDown) => {
                        healthy = false;
                        if in_flight.is_none() {
                            // Free the baton now; the poll source takes over.
                            held = None;
                        }
                    }
                    Some(StreamUpdate::Event(event)) => {
                        if healthy && held.is_some() && in_flight.is_none() {
                            match self.dispatch(event).await {
                                Some(done) => in_flight = Some(done),
                                None => break,
                            }
                        } else if let Some(superseded) = pending.replace(event) {
                            debug!(event = superseded.name(), "superseded by a newer stream event");
                        }
                    }
                },
                _ = recv_once(&mut in_flight) => {
                    if !healthy {
                        held = None;
                    } else if held.is_some()
                        && let Some(event) = pending.take()
                    {
                        match self.dispatch(event).await {
                            Some(done) => in_flight = Some(done),
                            None => break,
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn dispatch(&self, event: PingEvent) -> Option<oneshot::Receiver<()>> {
        let (msg, done) = ActionMessage::new(event);
        match self.actions.send(msg).await {
            Ok(()) => Some(done),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use conveyor_types::JobRef;

    use super::*;

    struct Harness {
        updates: mpsc::Sender<StreamUpdate>,
        actions: mpsc::Receiver<ActionMessage>,
        baton: Baton,
        cancel: CancellationToken,
    }

    fn start() -> Harness {
        let (updates_tx, updates_rx) = mpsc::channel(16);
        let (actions_tx, actions_rx) = mpsc::channel(1);
        let baton = Baton::new();
        let cancel = CancellationToken::new();
        tokio::spawn(
            Coordinator::new(baton.clone(), updates_rx, actions_tx, cancel.clone()).run(),
        );
        Harness {
            updates: updates_tx,
            actions: actions_rx,
            baton,
            cancel,
        }
    }

    #[test_log::test(tokio::test)]
    async fn burst_before_baton_transfer_collapses_to_the_latest_event() {
        let mut h = start();
        h.updates
            .send(StreamUpdate::Event(PingEvent::Pause {
                reason: "flaky".into(),
                until: None,
            }))
            .await
            .unwrap();
        h.updates
            .send(StreamUpdate::Event(PingEvent::Idle))
            .await
            .unwrap();
        h.updates.send(StreamUpdate::HealthUp).await.unwrap();

        let msg = h.actions.recv().await.unwrap();
        assert_eq!(msg.event, PingEvent::Idle);
        let _ = msg.done.send(());
        h.cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn never_two_unacknowledged_actions() {
        let mut h = start();
        h.updates.send(StreamUpdate::HealthUp).await.unwrap();
        h.updates
            .send(StreamUpdate::Event(PingEvent::Disconnect))
            .await
            .unwrap();

        let first = h.actions.recv().await.unwrap();
        assert_eq!(first.event, PingEvent::Disconnect);

        // Two more events arrive while the first is unacknowledged.
        h.updates
            .send(StreamUpdate::Event(PingEvent::Pause {
                reason: "p".into(),
                until: None,
            }))
            .await
            .unwrap();
        h.updates
            .send(StreamUpdate::Event(PingEvent::JobAssigned(JobRef::new("J1"))))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(
            h.actions.try_recv().is_err(),
            "no dispatch while one is in flight"
        );

        let _ = first.done.send(());
        let second = h.actions.recv().await.unwrap();
        assert_eq!(second.event, PingEvent::JobAssigned(JobRef::new("J1")));
        let _ = second.done.send(());
        h.cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn health_down_releases_the_baton_for_polling() {
        let mut h = start();
        h.updates.send(StreamUpdate::HealthUp).await.unwrap();
        h.updates
            .send(StreamUpdate::Event(PingEvent::Idle))
            .await
            .unwrap();
        let msg = h.actions.recv().await.unwrap();
        let _ = msg.done.send(());
        assert!(h.baton.try_acquire().is_none(), "stream holds the baton");

        h.updates.send(StreamUpdate::HealthDown).await.unwrap();
        let permit = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(permit) = h.baton.try_acquire() {
                    break permit;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("baton released after health-down");
        drop(permit);
        h.cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn health_down_with_an_action_in_flight_releases_after_completion() {
        let mut h = start();
        h.updates.send(StreamUpdate::HealthUp).await.unwrap();
        h.updates
            .send(StreamUpdate::Event(PingEvent::Idle))
            .await
            .unwrap();
        let msg = h.actions.recv().await.unwrap();

        h.updates.send(StreamUpdate::HealthDown).await.unwrap();
        tokio::task::yield_now().await;
        assert!(
            h.baton.try_acquire().is_none(),
            "baton kept until the in-flight action completes"
        );

        let _ = msg.done.send(());
        let permit = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(permit) = h.baton.try_acquire() {
                    break permit;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("baton released after completion");
        drop(permit);
        h.cancel.cancel();
    }
}

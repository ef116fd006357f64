use std::sync::Arc;
use std::time::Duration;

use conveyor_api::{Backoff, ControlPlane, PingStreamConn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::OverrideRequest;
use crate::coordinator::StreamUpdate;

/// Consecutive connection failures (or server closes without a frame)
/// tolerated before giving the baton to the poll source for good.
const MAX_RETRIES: u32 = 5;

/// The long-lived server-push ping source.
///
/// Reconnects with exponential backoff (1s, 2s, 4s … capped at 60s) and
/// reports health transitions to the coordinator: `HealthUp` on connect,
/// `HealthDown` once `MAX_RETRIES` consecutive attempts failed. A frame
/// actually received resets the failure count.
pub struct StreamSource {
    api: Arc<dyn ControlPlane>,
    agent_id: String,
    updates: mpsc::Sender<StreamUpdate>,
    overrides: mpsc::Sender<OverrideRequest>,
    backoff: Backoff,
}

impl StreamSource {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        agent_id: String,
        updates: mpsc::Sender<StreamUpdate>,
        overrides: mpsc::Sender<OverrideRequest>,
    ) -> Self {
        Self {
            api,
            agent_id,
            updates,
            overrides,
            backoff: Backoff::Exponential {
                start: Duration::from_secs(1),
                cap: Duration::from_secs(60),
            },
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut attempts = 0u32;
        let mut conn: Option<PingStreamConn> = None;

        loop {
            let Some(active) = conn.as_mut() else {
                if attempts >= MAX_RETRIES {
                    warn!(attempts, "push stream unavailable, falling back to polling");
                    let _ = self.updates.send(StreamUpdate::HealthDown).await;
                    return;
                }
                if attempts > 0 {
                    let delay = self.backoff.delay(attempts - 1);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let opened = tokio::select! {
                    _ = cancel.cancelled() => return,
                    opened = self.api.open_ping_stream(&self.agent_id) => opened,
                };
                match opened {
                    Ok(new_conn) => {
                        debug!("push stream connected");
                        conn = Some(new_conn);
                        if self.updates.send(StreamUpdate::HealthUp).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        attempts += 1;
                        warn!(%err, attempts, "push stream connect failed");
                    }
                }
                continue;
            };

            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = active.next() => frame,
            };
            match frame {
                Some(frame) => {
                    attempts = 0;
                    if frame.endpoint.is_some() {
                        let _ = self
                            .overrides
                            .send(OverrideRequest {
                                endpoint: frame.endpoint.clone(),
                                request_headers: None,
                            })
                            .await;
                    }
                    if self
                        .updates
                        .send(StreamUpdate::Event(frame.event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    debug!("push stream closed by the server, reconnecting");
                    attempts += 1;
                    if let Some(closed) = conn.take() {
                        closed.close().await;
                    }
                }
            }
        }

        if let Some(open) = conn.take() {
            open.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use conveyor_api::StreamFrame;
    use conveyor_types::{JobRef, PingEvent};

    use super::*;
    use crate::test_support::FakeApi;

    struct Harness {
        updates: mpsc::Receiver<StreamUpdate>,
        overrides: mpsc::Receiver<OverrideRequest>,
        cancel: CancellationToken,
    }

    fn start(api: Arc<FakeApi>) -> Harness {
        let (updates_tx, updates_rx) = mpsc::channel(16);
        let (overrides_tx, overrides_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let source = StreamSource::new(
            api as Arc<dyn ControlPlane>,
            "A1".into(),
            updates_tx,
            overrides_tx,
        );
        tokio::spawn(source.run(cancel.clone()));
        Harness {
            updates: updates_rx,
            overrides: overrides_rx,
            cancel,
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn frames_become_events_after_health_up() {
        let api = Arc::new(FakeApi::default());
        api.stream_conns.lock().unwrap().push_back(Ok(vec![
            StreamFrame::event(PingEvent::Pause {
                reason: "p".into(),
                until: None,
            }),
            StreamFrame::event(PingEvent::JobAssigned(JobRef::new("J1"))),
        ]));
        let mut h = start(api);

        assert_eq!(h.updates.recv().await, Some(StreamUpdate::HealthUp));
        assert_eq!(
            h.updates.recv().await,
            Some(StreamUpdate::Event(PingEvent::Pause {
                reason: "p".into(),
                until: None
            }))
        );
        assert_eq!(
            h.updates.recv().await,
            Some(StreamUpdate::Event(PingEvent::JobAssigned(JobRef::new(
                "J1"
            ))))
        );
        h.cancel.cancel();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn server_close_reconnects_transparently() {
        let api = Arc::new(FakeApi::default());
        {
            let mut conns = api.stream_conns.lock().unwrap();
            conns.push_back(Ok(vec![StreamFrame::event(PingEvent::Idle)]));
            conns.push_back(Ok(vec![StreamFrame::event(PingEvent::Disconnect)]));
        }
        let mut h = start(api);

        assert_eq!(h.updates.recv().await, Some(StreamUpdate::HealthUp));
        assert_eq!(
            h.updates.recv().await,
            Some(StreamUpdate::Event(PingEvent::Idle))
        );
        // Server closes; the source reconnects without reporting down.
        assert_eq!(h.updates.recv().await, Some(StreamUpdate::HealthUp));
        assert_eq!(
            h.updates.recv().await,
            Some(StreamUpdate::Event(PingEvent::Disconnect))
        );
        h.cancel.cancel();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn five_consecutive_failures_report_health_down() {
        // The fake's default answer for an unscripted stream is a 503.
        let api = Arc::new(FakeApi::default());
        let mut h = start(api.clone());

        let started = tokio::time::Instant::now();
        assert_eq!(h.updates.recv().await, Some(StreamUpdate::HealthDown));
        assert_eq!(h.updates.recv().await, None);

        // Backoff between the five attempts: 1 + 2 + 4 + 8 seconds.
        assert!(started.elapsed() >= Duration::from_secs(15));
        let opens = api
            .calls()
            .iter()
            .filter(|c| *c == "open_ping_stream")
            .count();
        assert_eq!(opens, 5);
        assert!(h.overrides.try_recv().is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn endpoint_overrides_ride_the_frames() {
        let api = Arc::new(FakeApi::default());
        api.stream_conns.lock().unwrap().push_back(Ok(vec![StreamFrame {
            event: PingEvent::Idle,
            endpoint: Some("https://edge.example.com/v3".into()),
        }]));
        let mut h = start(api);

        assert_eq!(h.updates.recv().await, Some(StreamUpdate::HealthUp));
        assert_eq!(
            h.updates.recv().await,
            Some(StreamUpdate::Event(PingEvent::Idle))
        );
        let req = h.overrides.recv().await.unwrap();
        assert_eq!(req.endpoint.as_deref(), Some("https://edge.example.com/v3"));
        h.cancel.cancel();
    }
}

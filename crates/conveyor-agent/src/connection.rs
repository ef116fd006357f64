use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_api::wire::{HeartbeatRequest, Ping, RegisterRequest, RegisterResponse};
use conveyor_api::{ControlPlane, RetryPolicy, with_retries};
use conveyor_types::{AgentConfig, AgentError, EndpointState, ErrorKind, RegisteredAgent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::job::rfc3339_nanos;
use crate::redact;

/// Attempts for the logical "I am online" call.
const CONNECT_ATTEMPTS: u32 = 10;

/// An endpoint/header override pushed by the control plane, on its way to
/// the connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideRequest {
    pub endpoint: Option<String>,
    pub request_headers: Option<BTreeMap<String, String>>,
}

impl OverrideRequest {
    pub fn from_ping(ping: &Ping) -> Option<Self> {
        if ping.endpoint.is_none() && ping.request_headers.is_none() {
            return None;
        }
        Some(Self {
            endpoint: ping.endpoint.clone(),
            request_headers: ping.request_headers.clone(),
        })
    }
}

/// Registers the agent, keeps the logical connection alive, and applies
/// endpoint/header overrides with a connectivity probe and revert.
pub struct ConnectionManager {
    api: Arc<dyn ControlPlane>,
    endpoint: Arc<EndpointState>,
    config: Arc<AgentConfig>,
}

impl ConnectionManager {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        endpoint: Arc<EndpointState>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            api,
            endpoint,
            config,
        }
    }

    /// Register exactly once. Retryable failures back off up to a minute;
    /// a terminal status is fatal for startup.
    pub async fn register(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RegisteredAgent, AgentError> {
        let req = self.register_request();
        let resp = with_retries("register", RetryPolicy::register(), cancel, |_| {
            self.api.register(&req)
        })
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::TerminalStatus => {
                AgentError::new(ErrorKind::Fatal, "registration rejected")
                    .with_detail(err.to_string())
            }
            _ => err.into(),
        })?;

        self.api.set_token(&resp.access_token);
        if resp.endpoint.is_some() || resp.request_headers.is_some() {
            // Register overrides apply as-is; the connect call that follows
            // is the connectivity check for them.
            let endpoint = resp.endpoint.as_deref().and_then(parse_endpoint);
            self.endpoint.apply(endpoint, resp.request_headers.clone());
        }
        info!(
            id = %resp.id,
            name = %resp.name,
            access_token = %redact(&resp.access_token),
            "registered with the control plane"
        );
        Ok(registered_from(resp))
    }

    /// The logical "I am online" call, bounded constant-backoff retries.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        with_retries(
            "connect",
            RetryPolicy::connect(CONNECT_ATTEMPTS),
            cancel,
            |_| self.api.connect(),
        )
        .await?;
        info!("connected");
        Ok(())
    }

    /// Best-effort goodbye; failure is logged, never fatal.
    pub async fn disconnect(&self) {
        let attempt = with_retries(
            "disconnect",
            RetryPolicy::disconnect(),
            &CancellationToken::new(),
            |_| self.api.disconnect(),
        )
        .await;
        match attempt {
            Ok(()) => info!("disconnected"),
            Err(err) => warn!(%err, "disconnect failed, giving up"),
        }
    }

    /// Report liveness until cancelled. Failures are logged and retried at
    /// the next interval; they never terminate the agent by themselves.
    pub async fn heartbeat_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The register call just proved liveness; skip the immediate tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let req = HeartbeatRequest {
                sent_at: rfc3339_nanos(Utc::now()),
            };
            match self.api.heartbeat(&req).await {
                Ok(resp) => debug!(sent_at = %req.sent_at, received_at = %resp.received_at, "heartbeat"),
                Err(err) => warn!(%err, "heartbeat failed, will retry next interval"),
            }
        }
    }

    /// Consume override requests from the ping sources.
    pub async fn overrides_loop(
        &self,
        mut requests: mpsc::Receiver<OverrideRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            let req = tokio::select! {
                _ = cancel.cancelled() => return,
                req = requests.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            };
            self.apply_overrides(req).await;
        }
    }

    /// Replace endpoint and/or headers. A new endpoint must pass a
    /// connectivity check or the previous one is restored.
    pub async fn apply_overrides(&self, req: OverrideRequest) {
        let endpoint = req.endpoint.as_deref().and_then(parse_endpoint);
        let endpoint_changed = endpoint.is_some();
        if !endpoint_changed && req.request_headers.is_none() {
            return;
        }
        let prior = self
            .endpoint
            .apply(endpoint, req.request_headers.clone());
        if !endpoint_changed {
            return;
        }
        info!(endpoint = %self.endpoint.snapshot().base, "endpoint override received");
        if let Err(err) = self.api.connect().await {
            warn!(%err, "new endpoint failed its connectivity check, reverting");
            self.endpoint.restore(prior);
        }
    }

    fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            name: self.config.name.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            script_eval_enabled: true,
            ignore_in_dispatches: false,
            priority: self.config.priority.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: option_env!("CONVEYOR_BUILD_NUMBER").unwrap_or("dev").to_string(),
            meta_data: self.config.tags.clone(),
            pid: std::process::id(),
            machine_id: std::fs::read_to_string("/etc/machine-id")
                .map(|id| id.trim().to_string())
                .ok()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            features: if self.config.ping_stream_enabled {
                vec!["ping-stream".into()]
            } else {
                vec![]
            },
        }
    }
}

fn registered_from(resp: RegisterResponse) -> RegisteredAgent {
    RegisteredAgent {
        id: resp.id,
        name: resp.name,
        access_token: resp.access_token,
        ping_interval: Duration::from_secs(resp.ping_interval.max(1)),
        heartbeat_interval: Duration::from_secs(resp.heartbeat_interval.max(1)),
        job_status_interval: Duration::from_secs(resp.job_status_interval.max(1)),
    }
}

fn parse_endpoint(raw: &str) -> Option<Url> {
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(err) => {
            warn!(%err, endpoint = raw, "ignoring unparseable endpoint override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test_support::FakeApi;

    fn config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            token: "reg-token".into(),
            name: "agent-1".into(),
            tags: vec!["queue=default".into()],
            priority: None,
            endpoint: Url::parse("https://agent.buildkite.com/v3").unwrap(),
            request_headers: Default::default(),
            build_path: "/tmp/conveyor-builds".into(),
            hooks_path: None,
            plugins_path: None,
            sockets_path: None,
            cancel_grace_period: Duration::from_secs(10),
            signal_grace_period: Duration::from_secs(30),
            acquire_job: None,
            disconnect_after_job: false,
            disconnect_after_idle_timeout: None,
            allowed_env: vec![],
            spawn: 1,
            ping_stream_enabled: true,
            debug: false,
        })
    }

    fn manager(api: &Arc<FakeApi>) -> (ConnectionManager, Arc<EndpointState>) {
        let endpoint = Arc::new(EndpointState::new(
            Url::parse("https://agent.buildkite.com/v3").unwrap(),
        ));
        (
            ConnectionManager::new(api.clone() as Arc<dyn ControlPlane>, endpoint.clone(), config()),
            endpoint,
        )
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn register_switches_token_and_applies_overrides() {
        let api = Arc::new(FakeApi::default());
        *api.register_response.lock().unwrap() = Some(conveyor_api::wire::RegisterResponse {
            endpoint: Some("https://edge.example.com/v3".into()),
            request_headers: Some(BTreeMap::from([(
                "X-Region".to_string(),
                "eu".to_string(),
            )])),
            ..FakeApi::default_register_response()
        });
        let (manager, endpoint) = manager(&api);

        let registered = manager.register(&CancellationToken::new()).await.unwrap();

        assert_eq!(registered.access_token, "alpacas");
        assert_eq!(registered.ping_interval, Duration::from_secs(1));
        let snap = endpoint.snapshot();
        assert_eq!(snap.base.as_str(), "https://edge.example.com/v3");
        assert_eq!(snap.headers.get("X-Region").map(String::as_str), Some("eu"));
        assert!(api.calls().contains(&"set_token".to_string()));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failed_connectivity_check_reverts_the_endpoint_override() {
        let api = Arc::new(FakeApi::default());
        let (manager, endpoint) = manager(&api);

        *api.connect_failures.lock().unwrap() = 1;
        manager
            .apply_overrides(OverrideRequest {
                endpoint: Some("https://broken.example.com/v3".into()),
                request_headers: None,
            })
            .await;
        assert_eq!(
            endpoint.snapshot().base.as_str(),
            "https://agent.buildkite.com/v3"
        );

        manager
            .apply_overrides(OverrideRequest {
                endpoint: Some("https://edge.example.com/v3".into()),
                request_headers: None,
            })
            .await;
        assert_eq!(
            endpoint.snapshot().base.as_str(),
            "https://edge.example.com/v3"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn header_only_overrides_skip_the_connectivity_check() {
        let api = Arc::new(FakeApi::default());
        let (manager, endpoint) = manager(&api);

        manager
            .apply_overrides(OverrideRequest {
                endpoint: None,
                request_headers: Some(BTreeMap::from([(
                    "X-Region".to_string(),
                    "eu".to_string(),
                )])),
            })
            .await;

        assert!(!api.calls().contains(&"connect".to_string()));
        assert_eq!(
            endpoint.snapshot().headers.get("X-Region").map(String::as_str),
            Some("eu")
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn heartbeats_keep_going_through_failures() {
        let api = Arc::new(FakeApi::default());
        let (manager, _) = manager(&api);
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            manager
                .heartbeat_loop(Duration::from_secs(60), loop_cancel)
                .await;
        });
        tokio::time::sleep(Duration::from_secs(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let beats = api.calls().iter().filter(|c| *c == "heartbeat").count();
        assert!(beats >= 2 && beats <= 4, "saw {beats} heartbeats");
    }
}

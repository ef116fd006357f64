use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use conveyor_types::{Endpoint, EndpointState, Job, LogChunk};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ApiError;
use crate::sse::{PingStreamConn, SseParser, StreamFrame};
use crate::wire::{
    FinishRequest, HeaderTimesRequest, HeartbeatRequest, HeartbeatResponse, JobStateResponse,
    PauseRequest, Ping, RegisterRequest, RegisterResponse, SseMessage, StartRequest, StopRequest,
};

/// Server-hinted deadline, in milliseconds remaining, sent on every call.
const TIMEOUT_HEADER: &str = "Buildkite-Timeout-Milliseconds";

/// Where agents register when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "https://agent.buildkite.com/v3";

/// The narrow interface the control loops consume.
///
/// The production implementation is [`HttpClient`]; tests substitute
/// in-memory doubles. Agent-scoped calls sign with the current access
/// token; job-scoped calls sign with the job's own token.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ApiError>;
    async fn connect(&self) -> Result<(), ApiError>;
    async fn disconnect(&self) -> Result<(), ApiError>;
    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, ApiError>;
    async fn ping(&self) -> Result<Ping, ApiError>;
    async fn open_ping_stream(&self, agent_id: &str) -> Result<PingStreamConn, ApiError>;
    async fn accept_job(&self, job_id: &str) -> Result<Job, ApiError>;
    async fn acquire_job(&self, job_id: &str) -> Result<Job, ApiError>;
    async fn start_job(&self, job: &Job, req: &StartRequest) -> Result<(), ApiError>;
    async fn finish_job(&self, job: &Job, req: &FinishRequest) -> Result<(), ApiError>;
    async fn job_state(&self, job: &Job) -> Result<JobStateResponse, ApiError>;
    async fn upload_chunk(&self, job: &Job, chunk: &LogChunk) -> Result<(), ApiError>;
    async fn upload_header_times(
        &self,
        job: &Job,
        req: &HeaderTimesRequest,
    ) -> Result<(), ApiError>;
    /// Swap the token used for agent-scoped calls (registration token
    /// before register, access token after).
    fn set_token(&self, token: &str);
}

/// Control-plane client over HTTPS.
///
/// Endpoint and request headers are read as an atomic snapshot per call,
/// so overrides applied by the connection manager take effect on the next
/// request without any locking here.
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Arc<EndpointState>,
    token: ArcSwap<String>,
    request_timeout: Duration,
}

pub struct HttpClientBuilder {
    endpoint: Option<Arc<EndpointState>>,
    token: String,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClientBuilder {
    pub fn endpoint(mut self, endpoint: Arc<EndpointState>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpClient, reqwest::Error> {
        let endpoint = self.endpoint.unwrap_or_else(|| {
            Arc::new(EndpointState::new(
                url::Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            ))
        });
        let http = reqwest::Client::builder()
            .user_agent(self.user_agent)
            .build()?;
        Ok(HttpClient {
            http,
            endpoint,
            token: ArcSwap::from_pointee(self.token),
            request_timeout: self.request_timeout,
        })
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder {
            endpoint: None,
            token: String::new(),
            user_agent: format!("conveyor-agent/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(60),
        }
    }

    fn url_for(&self, path: &str) -> (String, Arc<Endpoint>) {
        let snapshot = self.endpoint.snapshot();
        let base = snapshot.base.as_str().trim_end_matches('/');
        (format!("{base}/{path}"), snapshot)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        token: &str,
    ) -> (reqwest::RequestBuilder, String) {
        let (url, snapshot) = self.url_for(path);
        let mut builder = self
            .http
            .request(method, &url)
            .timeout(self.request_timeout)
            .header("Authorization", format!("Token {token}"))
            .header(
                TIMEOUT_HEADER,
                self.request_timeout.as_millis().to_string(),
            );
        for (name, value) in &snapshot.headers {
            builder = builder.header(name, value);
        }
        (builder, url)
    }

    fn agent_request(&self, method: Method, path: &str) -> (reqwest::RequestBuilder, String) {
        let token = self.token.load_full();
        self.request(method, path, &token)
    }

    /// Ask the control plane to pause this agent.
    pub async fn pause(&self, req: &PauseRequest) -> Result<(), ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "pause");
        execute("POST", url, builder.json(req)).await.map(drop)
    }

    /// Lift a previously requested pause.
    pub async fn resume(&self) -> Result<(), ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "resume");
        execute("POST", url, builder).await.map(drop)
    }

    /// Report a stop, forced or graceful.
    pub async fn stop(&self, req: &StopRequest) -> Result<(), ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "stop");
        execute("POST", url, builder.json(req)).await.map(drop)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn execute(
    method: &'static str,
    url: String,
    builder: reqwest::RequestBuilder,
) -> Result<Response, ApiError> {
    let resp = builder.send().await.map_err(|source| ApiError::Transport {
        method,
        url: url.clone(),
        source,
    })?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    Err(ApiError::Status {
        method,
        url,
        status,
        retry_after,
    })
}

async fn decode<T: DeserializeOwned>(
    method: &'static str,
    url: String,
    resp: Response,
) -> Result<T, ApiError> {
    resp.json().await.map_err(|err| ApiError::Protocol {
        method,
        url,
        detail: err.to_string(),
    })
}

#[async_trait]
impl ControlPlane for HttpClient {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "register");
        let resp = execute("POST", url.clone(), builder.json(req)).await?;
        decode("POST", url, resp).await
    }

    async fn connect(&self) -> Result<(), ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "connect");
        execute("POST", url, builder).await.map(drop)
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "disconnect");
        execute("POST", url, builder).await.map(drop)
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, ApiError> {
        let (builder, url) = self.agent_request(Method::POST, "heartbeat");
        let resp = execute("POST", url.clone(), builder.json(req)).await?;
        decode("POST", url, resp).await
    }

    async fn ping(&self) -> Result<Ping, ApiError> {
        let (builder, url) = self.agent_request(Method::GET, "ping");
        let resp = execute("GET", url.clone(), builder).await?;
        decode("GET", url, resp).await
    }

    async fn open_ping_stream(&self, agent_id: &str) -> Result<PingStreamConn, ApiError> {
        // No per-request timeout: this connection is meant to live.
        let (url, snapshot) = self.url_for("stream");
        let token = self.token.load_full();
        let mut builder = self
            .http
            .get(&url)
            .query(&[("agent_id", agent_id)])
            .header("Authorization", format!("Token {token}"))
            .header("Accept", "text/event-stream");
        for (name, value) in &snapshot.headers {
            builder = builder.header(name, value);
        }
        let resp = execute("GET", url, builder).await?;

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut parser = SseParser::default();
            loop {
                let chunk = tokio::select! {
                    _ = child.cancelled() => break,
                    chunk = body.next() => chunk,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        warn!(%err, "ping stream body failed");
                        break;
                    }
                    // Server closed the stream.
                    None => break,
                };
                for payload in parser.feed(&bytes) {
                    let frame = match serde_json::from_str::<SseMessage>(&payload) {
                        Ok(msg) => match msg.event() {
                            Ok(event) => StreamFrame {
                                event,
                                endpoint: msg.endpoint,
                            },
                            Err(err) => {
                                warn!(%err, "dropping unintelligible stream message");
                                continue;
                            }
                        },
                        Err(err) => {
                            warn!(%err, payload, "dropping unparseable stream payload");
                            continue;
                        }
                    };
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(PingStreamConn::spawned(rx, cancel, task))
    }

    async fn accept_job(&self, job_id: &str) -> Result<Job, ApiError> {
        let (builder, url) = self.agent_request(Method::PUT, &format!("jobs/{job_id}/accept"));
        let resp = execute("PUT", url.clone(), builder).await?;
        decode("PUT", url, resp).await
    }

    async fn acquire_job(&self, job_id: &str) -> Result<Job, ApiError> {
        let (builder, url) = self.agent_request(Method::PUT, &format!("jobs/{job_id}/acquire"));
        let resp = execute("PUT", url.clone(), builder).await?;
        decode("PUT", url, resp).await
    }

    async fn start_job(&self, job: &Job, req: &StartRequest) -> Result<(), ApiError> {
        let (builder, url) =
            self.request(Method::PUT, &format!("jobs/{}/start", job.id), &job.token);
        execute("PUT", url, builder.json(req)).await.map(drop)
    }

    async fn finish_job(&self, job: &Job, req: &FinishRequest) -> Result<(), ApiError> {
        let (builder, url) =
            self.request(Method::PUT, &format!("jobs/{}/finish", job.id), &job.token);
        execute("PUT", url, builder.json(req)).await.map(drop)
    }

    async fn job_state(&self, job: &Job) -> Result<JobStateResponse, ApiError> {
        let (builder, url) = self.request(Method::GET, &format!("jobs/{}", job.id), &job.token);
        let resp = execute("GET", url.clone(), builder).await?;
        decode("GET", url, resp).await
    }

    async fn upload_chunk(&self, job: &Job, chunk: &LogChunk) -> Result<(), ApiError> {
        let (builder, url) =
            self.request(Method::POST, &format!("jobs/{}/chunks", job.id), &job.token);
        let builder = builder
            .query(&[
                ("sequence", chunk.sequence.to_string()),
                ("offset", chunk.offset.to_string()),
                ("size", chunk.size.to_string()),
            ])
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_ENCODING, "gzip")
            .body(chunk.payload().to_vec());
        execute("POST", url, builder).await.map(drop)
    }

    async fn upload_header_times(
        &self,
        job: &Job,
        req: &HeaderTimesRequest,
    ) -> Result<(), ApiError> {
        let (builder, url) = self.request(
            Method::POST,
            &format!("jobs/{}/header_times", job.id),
            &job.token,
        );
        execute("POST", url, builder.json(req)).await.map(drop)
    }

    fn set_token(&self, token: &str) {
        self.token.store(Arc::new(token.to_string()));
    }
}

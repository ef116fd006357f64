//! Scripted doubles for the control plane and the bootstrap runner.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_api::wire::{
    FinishRequest, HeaderTimesRequest, HeartbeatRequest, HeartbeatResponse, JobStateResponse,
    Ping, RegisterRequest, RegisterResponse, StartRequest,
};
use conveyor_api::{ApiError, ControlPlane, PingStreamConn, StreamFrame};
use conveyor_types::{Job, LogChunk};
use tokio::sync::watch;

use crate::bootstrap::{Bootstrap, BootstrapProcess, CommandSpec, ProcessControl};

pub(crate) fn status_err(method: &'static str, code: u16, retry_after: Option<u64>) -> ApiError {
    ApiError::Status {
        method,
        url: format!("fake://{method}"),
        status: reqwest::StatusCode::from_u16(code).unwrap(),
        retry_after: retry_after.map(Duration::from_secs),
    }
}

pub(crate) fn test_job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        env: HashMap::from([("BUILDKITE_COMMAND".to_string(), "echo echo".to_string())]),
        chunks_max_size_bytes: 1024,
        token: "job-token".to_string(),
    }
}

/// A control plane whose answers are queues the test fills in advance.
///
/// Every call appends to `calls` so ordering invariants (finish before
/// disconnect, and so on) can be asserted directly.
#[derive(Default)]
pub(crate) struct FakeApi {
    pub calls: Mutex<Vec<String>>,
    pub register_response: Mutex<Option<RegisterResponse>>,
    /// Statuses to fail upcoming register calls with, oldest first.
    pub register_failures: Mutex<VecDeque<u16>>,
    pub connect_failures: Mutex<u32>,
    /// Scripted ping outcomes; `Err(status)` fails the call. Empty = idle.
    pub pings: Mutex<VecDeque<Result<Ping, u16>>>,
    /// Scripted stream connections; `Ok(frames)` delivers then closes.
    pub stream_conns: Mutex<VecDeque<Result<Vec<StreamFrame>, u16>>>,
    pub accept_results: Mutex<VecDeque<Result<Job, u16>>>,
    /// Status plus optional Retry-After seconds.
    pub acquire_results: Mutex<VecDeque<Result<Job, (u16, Option<u64>)>>>,
    /// Job states handed to the cancel watch, oldest first. Empty = running.
    pub job_states: Mutex<VecDeque<String>>,
    /// sequence -> remaining 503s before that chunk uploads cleanly.
    pub chunk_failures: Mutex<HashMap<u64, u32>>,
    pub chunks: Mutex<Vec<(u64, u64, usize)>>,
    pub finish_failures: Mutex<u32>,
    pub finishes: Mutex<Vec<FinishRequest>>,
    pub header_times: Mutex<Vec<HeaderTimesRequest>>,
}

impl FakeApi {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn default_register_response() -> RegisterResponse {
        RegisterResponse {
            id: "A1".into(),
            name: "agent-1".into(),
            access_token: "alpacas".into(),
            endpoint: None,
            request_headers: None,
            ping_interval: 1,
            job_status_interval: 1,
            heartbeat_interval: 60,
            meta_data: vec![],
        }
    }
}

#[async_trait]
impl ControlPlane for FakeApi {
    async fn register(&self, _req: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        self.record("register");
        if let Some(code) = self.register_failures.lock().unwrap().pop_front() {
            return Err(status_err("POST /register", code, None));
        }
        Ok(self
            .register_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(Self::default_register_response))
    }

    async fn connect(&self) -> Result<(), ApiError> {
        self.record("connect");
        let mut failures = self.connect_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(status_err("POST /connect", 503, None));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        self.record("disconnect");
        Ok(())
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, ApiError> {
        self.record("heartbeat");
        Ok(HeartbeatResponse {
            sent_at: Some(req.sent_at.clone()),
            received_at: req.sent_at.clone(),
        })
    }

    async fn ping(&self) -> Result<Ping, ApiError> {
        self.record("ping");
        match self.pings.lock().unwrap().pop_front() {
            Some(Ok(ping)) => Ok(ping),
            Some(Err(code)) => Err(status_err("GET /ping", code, None)),
            None => Ok(Ping::default()),
        }
    }

    async fn open_ping_stream(&self, _agent_id: &str) -> Result<PingStreamConn, ApiError> {
        self.record("open_ping_stream");
        match self.stream_conns.lock().unwrap().pop_front() {
            Some(Ok(frames)) => {
                let (tx, conn) = PingStreamConn::channel(frames.len() + 1);
                for frame in frames {
                    let _ = tx.try_send(frame);
                }
                Ok(conn)
            }
            Some(Err(code)) => Err(status_err("GET /stream", code, None)),
            None => Err(status_err("GET /stream", 503, None)),
        }
    }

    async fn accept_job(&self, job_id: &str) -> Result<Job, ApiError> {
        self.record(format!("accept {job_id}"));
        match self.accept_results.lock().unwrap().pop_front() {
            Some(Ok(job)) => Ok(job),
            Some(Err(code)) => Err(status_err("PUT /accept", code, None)),
            None => Ok(test_job(job_id)),
        }
    }

    async fn acquire_job(&self, job_id: &str) -> Result<Job, ApiError> {
        self.record(format!("acquire {job_id}"));
        match self.acquire_results.lock().unwrap().pop_front() {
            Some(Ok(job)) => Ok(job),
            Some(Err((code, retry_after))) => {
                Err(status_err("PUT /acquire", code, retry_after))
            }
            None => Ok(test_job(job_id)),
        }
    }

    async fn start_job(&self, job: &Job, _req: &StartRequest) -> Result<(), ApiError> {
        self.record(format!("start {}", job.id));
        Ok(())
    }

    async fn finish_job(&self, job: &Job, req: &FinishRequest) -> Result<(), ApiError> {
        let mut failures = self.finish_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            self.record(format!("finish {} (failed)", job.id));
            return Err(status_err("PUT /finish", 503, None));
        }
        self.record(format!("finish {}", job.id));
        self.finishes.lock().unwrap().push(req.clone());
        Ok(())
    }

    async fn job_state(&self, job: &Job) -> Result<JobStateResponse, ApiError> {
        self.record(format!("job_state {}", job.id));
        let state = self
            .job_states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "running".to_string());
        Ok(JobStateResponse { state })
    }

    async fn upload_chunk(&self, _job: &Job, chunk: &LogChunk) -> Result<(), ApiError> {
        let mut failures = self.chunk_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&chunk.sequence) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(status_err("POST /chunks", 503, None));
            }
        }
        drop(failures);
        self.record(format!("chunk {}", chunk.sequence));
        self.chunks
            .lock()
            .unwrap()
            .push((chunk.sequence, chunk.offset, chunk.size));
        Ok(())
    }

    async fn upload_header_times(
        &self,
        job: &Job,
        req: &HeaderTimesRequest,
    ) -> Result<(), ApiError> {
        self.record(format!("header_times {}", job.id));
        self.header_times.lock().unwrap().push(req.clone());
        Ok(())
    }

    fn set_token(&self, _token: &str) {
        self.record("set_token");
    }
}

/// A bootstrap whose output and exit are scripted.
pub(crate) struct FakeBootstrap {
    pub output: Vec<Vec<u8>>,
    pub exit_status: i32,
    /// Block in `wait` until terminated or killed.
    pub hold: bool,
    /// Simulate a process that shrugs off SIGTERM.
    pub ignore_terminate: bool,
    pub spawn_error: Option<String>,
    pub spawned: Arc<Mutex<Vec<CommandSpec>>>,
    pub terminated: Arc<AtomicBool>,
    pub killed: Arc<AtomicBool>,
}

impl Default for FakeBootstrap {
    fn default() -> Self {
        Self {
            output: vec![b"echo\n".to_vec()],
            exit_status: 0,
            hold: false,
            ignore_terminate: false,
            spawn_error: None,
            spawned: Arc::new(Mutex::new(Vec::new())),
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Bootstrap for FakeBootstrap {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<BootstrapProcess> {
        if let Some(message) = &self.spawn_error {
            return Err(io::Error::other(message.clone()));
        }
        self.spawned.lock().unwrap().push(spec);

        let (tx, rx) = tokio::sync::mpsc::channel(self.output.len() + 1);
        for bytes in &self.output {
            let _ = tx.try_send(bytes.clone());
        }
        drop(tx);

        let (signal_tx, mut signal_rx) = watch::channel(if self.hold {
            None
        } else {
            Some(self.exit_status)
        });
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let code = loop {
                if let Some(code) = *signal_rx.borrow() {
                    break code;
                }
                if signal_rx.changed().await.is_err() {
                    break -1;
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(BootstrapProcess {
            output: rx,
            exit: exit_rx,
            control: Arc::new(FakeControl {
                signal: signal_tx,
                ignore_terminate: self.ignore_terminate,
                terminated: self.terminated.clone(),
                killed: self.killed.clone(),
            }),
        })
    }
}

pub(crate) struct FakeControl {
    signal: watch::Sender<Option<i32>>,
    ignore_terminate: bool,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl ProcessControl for FakeControl {
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_terminate {
            let _ = self.signal.send(Some(-1));
        }
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.signal.send(Some(-1));
    }
}

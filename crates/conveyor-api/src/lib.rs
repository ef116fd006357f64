pub mod client;
pub mod error;
pub mod retry;
pub mod sse;
pub mod wire;

pub use client::{ControlPlane, DEFAULT_ENDPOINT, HttpClient, HttpClientBuilder};
pub use error::ApiError;
pub use retry::{Backoff, RetryPolicy, with_retries};
pub use sse::{PingStreamConn, SseParser, StreamFrame};
pub use wire::{
    FinishRequest, HeaderTimesRequest, HeartbeatRequest, HeartbeatResponse, JobStateResponse,
    PauseRequest, Ping, RegisterRequest, RegisterResponse, SseMessage, StartRequest, StopRequest,
    UnknownAction,
};

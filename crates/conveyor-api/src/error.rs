use std::time::Duration;

use conveyor_types::{AgentError, ErrorKind};
use reqwest::StatusCode;

/// Statuses the control plane asks us to retry.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// A failed control-plane call, carrying enough context for the WARN/ERROR
/// log line (method, URL, status) and for retry classification.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response: refused/reset connections,
    /// timeouts, resolution failures, handshake failures, unexpected EOF.
    #[error("{method} {url}: {source}")]
    Transport {
        method: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{method} {url}: unexpected status {status}")]
    Status {
        method: &'static str,
        url: String,
        status: StatusCode,
        /// Server-supplied override for the next backoff interval.
        retry_after: Option<Duration>,
    },
    /// The response arrived but could not be decoded.
    #[error("{method} {url}: malformed response: {detail}")]
    Protocol {
        method: &'static str,
        url: String,
        detail: String,
    },
    /// The surrounding task was cancelled mid-call. Never retried.
    #[error("call cancelled")]
    Cancelled,
}

impl ApiError {
    /// Coarse category used by the retry wrapper and shutdown paths.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Status { status, .. } => {
                if RETRYABLE_STATUSES.contains(&status.as_u16()) {
                    ErrorKind::RetryableStatus
                } else {
                    ErrorKind::TerminalStatus
                }
            }
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The HTTP status, when the server produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-hinted delay before the next attempt (`Retry-After` seconds).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ApiError> for AgentError {
    fn from(err: ApiError) -> Self {
        AgentError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(code: u16) -> ApiError {
        ApiError::Status {
            method: "POST",
            url: "https://agent.buildkite.com/v3/ping".into(),
            status: StatusCode::from_u16(code).unwrap(),
            retry_after: None,
        }
    }

    #[test]
    fn retryable_statuses_match_the_protocol_set() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(status_error(code).is_retryable(), "status {code}");
        }
        for code in [400, 401, 404, 409, 422, 423] {
            assert!(!status_error(code).is_retryable(), "status {code}");
            assert_eq!(status_error(code).kind(), ErrorKind::TerminalStatus);
        }
    }

    #[test]
    fn cancelled_is_never_retryable() {
        assert!(!ApiError::Cancelled.is_retryable());
        assert_eq!(ApiError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}

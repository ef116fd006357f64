use std::fmt;

/// Canonical category for a control-plane or job failure.
///
/// This is intentionally coarse-grained: it is used for policy decisions
/// (retry or abort) and for observability dimensions in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level failure: refused/reset connections, timeouts,
    /// resolution failures, handshake failures, unexpected EOF.
    ///
    /// Always retryable.
    Transport,
    /// HTTP status the control plane asks us to retry (408, 429, 5xx).
    RetryableStatus,
    /// HTTP status that will not improve with retries (other 4xx).
    TerminalStatus,
    /// The response arrived but could not be understood.
    Protocol,
    /// Local validation refused the operation (for example the job env
    /// failed the allowlist check). The job is refused, the worker lives.
    Policy,
    /// Operation was intentionally cancelled.
    ///
    /// A control-flow decision, not a fault. Never retried.
    Cancelled,
    /// Unrecoverable configuration or startup failure. Exits the process.
    Fatal,
}

impl ErrorKind {
    /// Whether the retry wrapper may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::RetryableStatus)
    }
}

/// Structured failure payload carried through the agent's control loops.
///
/// This replaces raw string errors with a stable shape that is easy to:
/// - classify (`kind`) for retry/policy decisions,
/// - render (`message`) for user-facing summaries,
/// - enrich (`detail`) with optional low-level diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    /// Coarse failure category used by policy and observability.
    pub kind: ErrorKind,
    /// Human-readable summary safe to display in normal logs.
    pub message: String,
    /// Optional diagnostic detail for debugging and deep triage.
    ///
    /// Prefer concise, actionable context. Omit when no extra detail exists.
    pub detail: Option<String>,
}

impl AgentError {
    /// Creates an [`AgentError`] with required fields only.
    ///
    /// Use [`Self::with_detail`] to attach optional diagnostic context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Adds or replaces the optional diagnostic detail.
    ///
    /// If called multiple times, the last value wins.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Shorthand for a [`ErrorKind::Cancelled`] error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Whether the retry wrapper may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_retryable_status_retry() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::RetryableStatus.is_retryable());
        assert!(!ErrorKind::TerminalStatus.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
        assert!(!ErrorKind::Policy.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn display_includes_detail_when_present() {
        let err = AgentError::new(ErrorKind::TerminalStatus, "register rejected")
            .with_detail("status 401");
        assert_eq!(
            err.to_string(),
            "TerminalStatus: register rejected (status 401)"
        );

        let bare = AgentError::new(ErrorKind::Transport, "connection reset");
        assert_eq!(bare.to_string(), "Transport: connection reset");
    }
}

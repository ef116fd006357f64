use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ApiError;

/// Delay schedule between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Constant(Duration),
    /// `start * 2^attempt`, capped.
    Exponential { start: Duration, cap: Duration },
}

impl Backoff {
    /// Delay after the given failed attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Constant(delay) => delay,
            Self::Exponential { start, cap } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                start.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// How a call is retried: schedule plus an optional attempt budget.
///
/// `Retry-After` from the server overrides the computed delay for the
/// next attempt, whatever the schedule says.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Total attempts allowed; `None` retries until a terminal error.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Registration: exponential backoff bounded at 60s, no attempt cap.
    /// Terminal statuses abort startup regardless.
    pub fn register() -> Self {
        Self {
            backoff: Backoff::Exponential {
                start: Duration::from_secs(1),
                cap: Duration::from_secs(60),
            },
            max_attempts: None,
        }
    }

    /// Connect: constant backoff, bounded attempts.
    pub fn connect(max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Constant(Duration::from_secs(5)),
            max_attempts: Some(max_attempts),
        }
    }

    /// Disconnect is best-effort: a few quick tries, then give up.
    pub fn disconnect() -> Self {
        Self {
            backoff: Backoff::Constant(Duration::from_secs(1)),
            max_attempts: Some(4),
        }
    }

    /// Per-job calls (accept/start/header times): bounded exponential.
    pub fn job_call() -> Self {
        Self {
            backoff: Backoff::Exponential {
                start: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
            max_attempts: Some(7),
        }
    }

    /// Chunk uploads: quick bounded retries so one bad chunk cannot stall
    /// the uploader pool for long.
    pub fn chunk_upload() -> Self {
        Self {
            backoff: Backoff::Exponential {
                start: Duration::from_secs(1),
                cap: Duration::from_secs(15),
            },
            max_attempts: Some(5),
        }
    }

    /// The delay to sleep after a failed attempt, honoring `Retry-After`.
    pub fn next_delay(&self, attempt: u32, err: &ApiError) -> Duration {
        err.retry_after().unwrap_or_else(|| self.backoff.delay(attempt))
    }
}

/// Run `op` until it succeeds, fails terminally, exhausts the attempt
/// budget, or the token is cancelled.
///
/// `op` receives the 0-based attempt number. Only errors whose kind is
/// retryable are retried; everything else surfaces immediately.
pub async fn with_retries<T, Op, Fut>(
    what: &'static str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: Op,
) -> Result<T, ApiError>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                let next = attempt + 1;
                if let Some(max) = policy.max_attempts {
                    if next >= max {
                        return Err(err);
                    }
                }
                let delay = policy.next_delay(attempt, &err);
                warn!(%err, attempt = next, ?delay, "{what} failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = next;
            }
            Err(err) => return Err(err),
        }
    }
}

//! Retry and deadline wrapper for calls to upstream providers.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::OAuthConfig;
use crate::error::AuthError;

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of one attempt that did not succeed.
#[derive(Debug)]
pub enum CallError {
    /// Connection-level failure; worth another attempt.
    Transient(String),
    /// Final answer, returned as is.
    Fatal(AuthError),
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            CallError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            CallError::Fatal(AuthError::UpstreamRejected {
                status: status.as_u16(),
            })
        } else {
            CallError::Fatal(AuthError::UpstreamInvalidResponse(err.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Bound on the whole call, retries and backoff included.
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            deadline: Duration::from_millis(config.exchange_timeout_ms),
        }
    }

    /// Exponential backoff with up to 50% added jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF);
        let jitter_ms = exp.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OAuthConfig::default())
    }
}

/// Runs `call` until it succeeds, fails fatally, runs out of attempts, or
/// the policy deadline passes. The last two both surface as
/// [`AuthError::UpstreamTimeout`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, AuthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let attempts = async {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(err)) => {
                    tracing::warn!(operation, attempt, error = %err, "Upstream call failed");
                    return Err(err);
                }
                Err(CallError::Transient(reason)) if attempt >= policy.max_attempts => {
                    tracing::warn!(operation, attempt, reason = %reason, "Upstream call gave up after retries");
                    return Err(AuthError::UpstreamTimeout(policy.deadline));
                }
                Err(CallError::Transient(reason)) => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    };

    match tokio::time::timeout(policy.deadline, attempts).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, deadline_ms = policy.deadline.as_millis() as u64, "Upstream call timed out");
            Err(AuthError::UpstreamTimeout(policy.deadline))
        }
    }
}

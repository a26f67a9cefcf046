//! Retry with exponential backoff for unary LLM calls.
//!
//! Streaming calls never retry automatically; once a stream has yielded its
//! first event we are committed and cannot roll back what the caller saw.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;

/// Backoff policy for retryable errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of re-attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any computed or provider-mandated delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt: delay(k) = base * multiplier^k.
    pub backoff_multiplier: f64,
    /// Multiply the final delay by a uniform [0.5, 1.5] factor.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-indexed). A provider-supplied
    /// `retry_after` overrides the computed backoff, clamped by `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed =
            Duration::from_secs_f64(self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32));
        let mut delay = retry_after.unwrap_or(computed).min(self.max_delay);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
            delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        }
        delay
    }
}

/// Sleep abstraction so tests can observe delays without waiting them out.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Drive `op` until it succeeds, a non-retryable error surfaces, or the
/// policy's retry budget is spent. Cancellation during the backoff sleep
/// surfaces immediately as the cancellation error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(LLMError::cancelled(""));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.retryable() || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt, err.retry_after());
                debug!(
                    "retryable {} error, attempt {}/{}, sleeping {:?}",
                    err.kind(),
                    attempt + 1,
                    policy.max_retries,
                    delay
                );
                attempt += 1;
                tokio::select! {
                    _ = sleeper.sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(LLMError::cancelled("")),
                }
            }
        }
    }
}

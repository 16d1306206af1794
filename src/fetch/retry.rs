use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff around a fallible async operation
///
/// Attempt `n` failing (1-based) is followed by a sleep of
/// `min(base_delay * 2^(n-1), max_delay)`, optionally jittered, before
/// attempt `n + 1`. `max_attempts` counts every attempt including the first.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.0,
        }
    }

    /// Spreads each delay uniformly over `[d * (1 - jitter), d * (1 + jitter)]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs_f64(config.base_delay_seconds),
            Duration::from_secs_f64(config.max_delay_seconds),
        )
        .with_jitter(config.jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out
    ///
    /// The last error is returned unchanged once attempts are exhausted.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.execute_notify(operation, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `notify(error, attempt, delay)`
    /// before every backoff sleep
    ///
    /// `notify` is where callers react to the failure kind, e.g. forcing a new
    /// egress identity after a block.
    pub async fn execute_notify<T, E, F, Fut, N>(
        &self,
        mut operation: F,
        mut notify: N,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
        N: FnMut(&E, u32, Duration),
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.max_attempts {
                        return Err(error);
                    }

                    let delay = self.jittered(self.backoff_delay(attempt));
                    notify(&error, attempt, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

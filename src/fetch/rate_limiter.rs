use crate::config::FetchConfig;
use crate::ConfigError;
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::Quota;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket shared by every worker that talks to the same upstream
///
/// Backed by a GCRA limiter: up to `burst_size` requests go out at once, and
/// after that one token is replenished every `1 / requests_per_second`
/// seconds. Fractional rates such as one request every four seconds are
/// expressed through the replenish period.
pub struct RateLimiter {
    limiter: DirectLimiter,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    /// Creates a full bucket
    ///
    /// # Arguments
    ///
    /// * `requests_per_second` - Sustained refill rate, must be positive and finite
    /// * `burst_size` - Bucket capacity, clamped to at least one token
    pub fn new(requests_per_second: f64, burst_size: u32) -> Result<Self, ConfigError> {
        let invalid = || {
            ConfigError::Validation(format!(
                "requests_per_second must be a positive number, got {}",
                requests_per_second
            ))
        };

        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(invalid());
        }

        let period = Duration::try_from_secs_f64(1.0 / requests_per_second).map_err(|_| invalid())?;
        let burst = NonZeroU32::new(burst_size.max(1)).ok_or_else(invalid)?;
        let quota = Quota::with_period(period).ok_or_else(invalid)?.allow_burst(burst);

        Ok(Self {
            limiter: governor::RateLimiter::direct(quota),
            capacity: burst.get(),
            refill_rate: requests_per_second,
        })
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self, ConfigError> {
        Self::new(config.requests_per_second, config.burst_size)
    }

    /// Waits until a token is available and consumes it
    ///
    /// Never fails.
    pub async fn acquire(&self) {
        if self.limiter.check().is_ok() {
            return;
        }
        tracing::trace!("Rate limiter: bucket empty, waiting for a token");
        self.limiter.until_ready().await;
    }

    /// Consumes a token only if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

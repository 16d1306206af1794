//! Request resilience layer
//!
//! - [`RateLimiter`]: token bucket shared by all workers
//! - [`RetryPolicy`]: exponential backoff with jitter
//! - [`ProxyRotator`]: round-robin egress identities
//! - [`BlockDetector`]: separates content from refusals
//! - [`ResilientFetcher`]: the four composed into one operation

mod block;
mod fetcher;
mod proxy;
mod rate_limiter;
mod retry;

pub use block::{BlockDetector, BlockReason, ResponseView, Verdict};
pub use fetcher::{FetchResult, FetchStatus, ResilientFetcher};
pub use proxy::{ProxyIdentity, ProxyRotator, DEFAULT_USER_AGENTS};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryPolicy, Retryable};

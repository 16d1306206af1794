//! Resilient fetcher
//!
//! Composes the admission, identity, detection and retry layers into one
//! "fetch or fail" operation. Per attempt the order is fixed:
//!
//! 1. `RateLimiter::acquire` (the token is spent even if the attempt fails)
//! 2. `ProxyRotator::next` picks the identity and its pre-built client
//! 3. GET with manual redirect following, bounded by the client timeout
//! 4. `BlockDetector::classify`
//!
//! A blocked attempt forces an extra `rotate()` before the backoff sleep, and
//! the retry never reuses the identity that was just blocked while another
//! one exists.

use crate::config::{Config, FetchConfig};
use crate::fetch::{
    BlockDetector, BlockReason, ProxyIdentity, ProxyRotator, RateLimiter, ResponseView,
    RetryPolicy, Retryable, Verdict,
};
use crate::metrics::MetricsRegistry;
use crate::pipeline::WorkUnit;
use crate::FetchError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{redirect::Policy, Client, Proxy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Final classification of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Blocked,
    TransientError,
    FatalError,
}

/// Outcome of [`ResilientFetcher::fetch`]
///
/// Describes the last attempt made: its latency, the identity that served it
/// and, for failures, the error that ended the retry loop.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: FetchStatus,
    /// Response body, present only on success
    pub payload: Option<Vec<u8>>,
    pub latency: Duration,
    pub identity_used: ProxyIdentity,
    /// URL after redirects
    pub final_url: Option<String>,
    pub http_status: Option<u16>,
    /// Attempts made, first try included
    pub attempts: u32,
    pub error: Option<FetchError>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }

    /// Turns a failed result into its error
    pub fn into_outcome(self) -> Result<FetchResult, FetchError> {
        match self.error.clone() {
            Some(error) if !self.is_success() => Err(error),
            _ => Ok(self),
        }
    }
}

/// A response that made it through one attempt
struct Served {
    body: Vec<u8>,
    status: u16,
    final_url: String,
    identity: ProxyIdentity,
    attempt: u32,
    latency: Duration,
}

/// A failed attempt with the context needed to report it
struct Failed {
    error: FetchError,
    http_status: Option<u16>,
    identity: ProxyIdentity,
    attempt: u32,
    latency: Duration,
}

impl Retryable for Failed {
    fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Raw response after redirects, before classification
struct RawResponse {
    status: u16,
    body: Vec<u8>,
    redirects: usize,
    final_url: String,
}

/// Rate-limited, identity-rotating, retrying HTTP fetcher
///
/// Shared by every worker; all internal state is behind `Arc`s or atomics.
#[derive(Debug)]
pub struct ResilientFetcher {
    /// One client per rotator identity, indexed by `ProxyIdentity::slot`
    clients: Vec<Client>,
    rotator: Arc<ProxyRotator>,
    limiter: Arc<RateLimiter>,
    detector: BlockDetector,
    retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ResilientFetcher {
    /// Builds a fetcher around explicitly constructed policies
    ///
    /// # Arguments
    ///
    /// * `config` - Timeout, headers and block detection settings
    /// * `rotator` - Identities to rotate through; one client is built per identity
    /// * `limiter` - Token bucket shared with any other fetcher hitting the same upstream
    /// * `retry` - Backoff policy applied to Blocked and Transient failures
    /// * `metrics` - Registry receiving attempt counters and fetch timings
    ///
    /// # Returns
    ///
    /// * `Ok(ResilientFetcher)` - All clients were built
    /// * `Err(reqwest::Error)` - A proxy or header could not be turned into a client
    pub fn new(
        config: &FetchConfig,
        rotator: Arc<ProxyRotator>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, reqwest::Error> {
        let headers = build_headers(config);
        let timeout = Duration::from_secs(config.timeout_seconds);

        let clients = rotator
            .identities()
            .iter()
            .map(|identity| build_client(identity, &headers, timeout))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Built {} HTTP clients", clients.len());

        Ok(Self {
            clients,
            rotator,
            limiter,
            detector: BlockDetector::from_config(config),
            retry,
            metrics,
        })
    }

    /// Builds every policy from the configuration
    pub fn from_config(config: &Config, metrics: Arc<MetricsRegistry>) -> crate::Result<Self> {
        let limiter = RateLimiter::from_config(&config.fetch)?;
        let fetcher = Self::new(
            &config.fetch,
            Arc::new(ProxyRotator::from_config(&config.identity)),
            Arc::new(limiter),
            RetryPolicy::from_config(&config.retry),
            metrics,
        )?;
        Ok(fetcher)
    }

    pub fn rotator(&self) -> &ProxyRotator {
        &self.rotator
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn fetch(&self, unit: &WorkUnit) -> FetchResult {
        self.fetch_url(&unit.target).await
    }

    /// Fetches a URL until it succeeds, fails fatally, or attempts run out
    pub async fn fetch_url(&self, url: &str) -> FetchResult {
        let blocked_slot = AtomicUsize::new(usize::MAX);
        let blocked_slot = &blocked_slot;

        let outcome = self
            .retry
            .execute_notify(
                move |attempt| {
                    let mut identity = self.rotator.next();
                    // Step past the identity that was just blocked
                    let just_blocked = identity.slot == blocked_slot.load(Ordering::Acquire);
                    if just_blocked && self.rotator.len() > 1 {
                        identity = self.rotator.next();
                    }
                    self.attempt(url, identity.clone(), attempt)
                },
                |failed, attempt, delay| {
                    if failed.error.is_blocked() {
                        self.rotator.rotate();
                        blocked_slot.store(failed.identity.slot, Ordering::Release);
                    }
                    tracing::warn!(
                        "Attempt {} for {} failed ({}), retrying in {:.1}s",
                        attempt,
                        url,
                        failed.error,
                        delay.as_secs_f64()
                    );
                },
            )
            .await;

        match outcome {
            Ok(served) => {
                tracing::debug!(
                    "Fetched {} via {} in {}ms (attempt {})",
                    served.final_url,
                    served.identity,
                    served.latency.as_millis(),
                    served.attempt
                );
                FetchResult {
                    status: FetchStatus::Success,
                    payload: Some(served.body),
                    latency: served.latency,
                    identity_used: served.identity,
                    final_url: Some(served.final_url),
                    http_status: Some(served.status),
                    attempts: served.attempt,
                    error: None,
                }
            }
            Err(failed) => {
                let status = match failed.error {
                    FetchError::Blocked { .. } => FetchStatus::Blocked,
                    FetchError::Transient { .. } => FetchStatus::TransientError,
                    FetchError::Fatal { .. } => FetchStatus::FatalError,
                };
                FetchResult {
                    status,
                    payload: None,
                    latency: failed.latency,
                    identity_used: failed.identity,
                    final_url: None,
                    http_status: failed.http_status,
                    attempts: failed.attempt,
                    error: Some(failed.error),
                }
            }
        }
    }

    /// One attempt: admission, request, classification
    async fn attempt(
        &self,
        url: &str,
        identity: ProxyIdentity,
        attempt: u32,
    ) -> Result<Served, Failed> {
        // Admission
        self.limiter.acquire().await;
        self.metrics.increment("fetch.attempts");

        // Request
        let started = Instant::now();
        let timer = self.metrics.start_timer("fetch");
        let response = self.request(&self.clients[identity.slot], url).await;
        drop(timer);
        let latency = started.elapsed();

        let failed = |error: FetchError, http_status: Option<u16>| {
            self.metrics.increment(&format!("fetch.{}", error.kind()));
            Failed {
                error,
                http_status,
                identity: identity.clone(),
                attempt,
                latency,
            }
        };

        let raw = match response {
            Ok(raw) => raw,
            Err(error) => return Err(failed(error, None)),
        };

        // Classification
        let view = ResponseView {
            status: raw.status,
            body: &raw.body,
            redirects: raw.redirects,
        };

        if let Verdict::Blocked(reason) = self.detector.classify(&view) {
            // Server errors are retried as-is, without burning an identity
            let error = match reason {
                BlockReason::ServerError(code) => FetchError::Transient {
                    url: url.to_string(),
                    message: format!("HTTP {}", code),
                },
                reason => {
                    tracing::info!("Blocked at {} via {}: {}", url, identity, reason);
                    FetchError::Blocked {
                        url: url.to_string(),
                        reason,
                    }
                }
            };
            return Err(failed(error, Some(raw.status)));
        }

        if !(200..300).contains(&raw.status) {
            let error = FetchError::Fatal {
                url: url.to_string(),
                message: format!("HTTP {}", raw.status),
            };
            return Err(failed(error, Some(raw.status)));
        }

        Ok(Served {
            body: raw.body,
            status: raw.status,
            final_url: raw.final_url,
            identity,
            attempt,
            latency,
        })
    }

    /// Sends a GET and follows redirects by hand, counting the hops
    ///
    /// Following stops one hop past the tolerated chain length; the detector
    /// then flags the response as a redirect chain.
    async fn request(&self, client: &Client, url: &str) -> Result<RawResponse, FetchError> {
        let mut current = parse_target(url)?;
        let mut redirects = 0;

        loop {
            let response = client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| classify_reqwest_error(url, e))?;

            let status = response.status();

            // Follow the Location header ourselves so hops can be counted
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                if let Some(location) = location {
                    let next = current.join(&location).map_err(|e| FetchError::Fatal {
                        url: url.to_string(),
                        message: format!("Invalid redirect location '{}': {}", location, e),
                    })?;

                    redirects += 1;
                    tracing::trace!("Redirect {} -> {}", current, next);
                    current = next;

                    // Too long a chain: hand it to the detector without a body
                    if redirects > self.detector.max_redirects() {
                        return Ok(RawResponse {
                            status: status.as_u16(),
                            body: Vec::new(),
                            redirects,
                            final_url: current.to_string(),
                        });
                    }
                    continue;
                }
            }

            // Final response
            let body = response
                .bytes()
                .await
                .map_err(|e| classify_reqwest_error(url, e))?;

            return Ok(RawResponse {
                status: status.as_u16(),
                body: body.to_vec(),
                redirects,
                final_url: current.to_string(),
            });
        }
    }
}

/// Parses a target, rejecting anything that is not http(s)
fn parse_target(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::Fatal {
        url: url.to_string(),
        message: format!("Malformed URL: {}", e),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(FetchError::Fatal {
            url: url.to_string(),
            message: format!("Unsupported scheme '{}'", scheme),
        }),
    }
}

/// Maps a client error onto the fetch taxonomy
///
/// Only request construction problems are fatal; anything that happened on
/// the wire may succeed on another attempt or through another proxy.
fn classify_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        return FetchError::Fatal {
            url: url.to_string(),
            message: error.to_string(),
        };
    }

    let message = if error.is_timeout() {
        "Request timeout".to_string()
    } else if error.is_connect() {
        format!("Connection failed: {}", error)
    } else {
        error.to_string()
    };

    FetchError::Transient {
        url: url.to_string(),
        message,
    }
}

fn build_headers(config: &FetchConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("Ignoring invalid header '{}'", name),
        }
    }
    headers
}

/// Builds the client bound to one identity
///
/// The proxy is fixed at construction, so each identity needs its own client.
fn build_client(
    identity: &ProxyIdentity,
    headers: &HeaderMap,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(identity.user_agent.as_str())
        .default_headers(headers.clone())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::none()) // Redirects are counted manually
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = &identity.proxy {
        builder = builder.proxy(Proxy::all(proxy.as_str())?);
    }

    builder.build()
}

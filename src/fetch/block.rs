use crate::config::FetchConfig;
use std::fmt;

/// Why a response was judged to be a refusal rather than content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// HTTP 429
    Throttled,
    /// HTTP 5xx
    ServerError(u16),
    /// A status configured as blocking, such as 403
    Status(u16),
    /// Body contained a challenge marker
    Marker(String),
    /// More redirects than the configured threshold
    RedirectChain(usize),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled => write!(f, "throttled (HTTP 429)"),
            Self::ServerError(status) => write!(f, "server error (HTTP {})", status),
            Self::Status(status) => write!(f, "blocking status (HTTP {})", status),
            Self::Marker(marker) => write!(f, "challenge marker '{}'", marker),
            Self::RedirectChain(hops) => write!(f, "redirect chain of {} hops", hops),
        }
    }
}

/// Classification produced by [`BlockDetector::classify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Usable,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// The parts of a response the detector looks at
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub body: &'a [u8],
    /// Redirect hops followed before this response
    pub redirects: usize,
}

/// Pure classifier separating real content from refusals and challenges
#[derive(Debug, Clone)]
pub struct BlockDetector {
    /// Stored lowercased
    markers: Vec<String>,
    statuses: Vec<u16>,
    max_redirects: usize,
}

impl BlockDetector {
    pub fn new(markers: Vec<String>, statuses: Vec<u16>, max_redirects: usize) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
            statuses,
            max_redirects,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.block_markers.clone(),
            config.block_statuses.clone(),
            config.max_redirects as usize,
        )
    }

    /// Redirect hops tolerated before a chain counts as blocked
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Classifies a response; performs no I/O and never fails
    ///
    /// Checks run cheapest first: status, redirect count, then the body scan.
    pub fn classify(&self, response: &ResponseView<'_>) -> Verdict {
        let status = response.status;

        if status == 429 {
            return Verdict::Blocked(BlockReason::Throttled);
        }

        if (500..=599).contains(&status) {
            return Verdict::Blocked(BlockReason::ServerError(status));
        }

        if self.statuses.contains(&status) {
            return Verdict::Blocked(BlockReason::Status(status));
        }

        if response.redirects > self.max_redirects {
            return Verdict::Blocked(BlockReason::RedirectChain(response.redirects));
        }

        if !self.markers.is_empty() && !response.body.is_empty() {
            let body = String::from_utf8_lossy(response.body).to_lowercase();
            if let Some(marker) = self.markers.iter().find(|m| body.contains(m.as_str())) {
                return Verdict::Blocked(BlockReason::Marker(marker.clone()));
            }
        }

        Verdict::Usable
    }
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

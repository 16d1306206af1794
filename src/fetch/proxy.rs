use crate::config::IdentityConfig;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Browser user agents used when the configuration does not list any
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
];

/// One egress identity: an optional proxy plus the user agent sent through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyIdentity {
    /// Position in the rotator, also the index of the HTTP client bound to it
    pub slot: usize,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl ProxyIdentity {
    pub fn is_direct(&self) -> bool {
        self.proxy.is_none()
    }
}

impl fmt::Display for ProxyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "#{} via {}", self.slot, proxy),
            None => write!(f, "#{} direct", self.slot),
        }
    }
}

/// Round-robin over a fixed list of egress identities
///
/// The identity list is built once; the only mutable state is the cursor,
/// advanced with an atomic increment-and-wrap so concurrent workers never
/// observe an out-of-range index.
#[derive(Debug)]
pub struct ProxyRotator {
    identities: Vec<ProxyIdentity>,
    cursor: AtomicUsize,
}

impl ProxyRotator {
    /// Pairs proxies with user agents
    ///
    /// The list is as long as the longer of the two inputs; the shorter one
    /// cycles. No proxies yields direct identities, and with neither proxies
    /// nor user agents a single direct identity with a default agent is used.
    pub fn new(proxies: Vec<String>, user_agents: Vec<String>) -> Self {
        let user_agents = if user_agents.is_empty() {
            vec![DEFAULT_USER_AGENTS[0].to_string()]
        } else {
            user_agents
        };

        let count = proxies.len().max(user_agents.len());
        let identities = (0..count)
            .map(|slot| ProxyIdentity {
                slot,
                proxy: if proxies.is_empty() {
                    None
                } else {
                    Some(proxies[slot % proxies.len()].clone())
                },
                user_agent: user_agents[slot % user_agents.len()].clone(),
            })
            .collect();

        Self {
            identities,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Builds the rotator, falling back to the built-in browser agents
    pub fn from_config(config: &IdentityConfig) -> Self {
        let user_agents = if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect()
        } else {
            config.user_agents.clone()
        };
        Self::new(config.proxies.clone(), user_agents)
    }

    /// A rotator holding one direct identity
    pub fn direct() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Returns the identity under the cursor and advances it
    pub fn next(&self) -> &ProxyIdentity {
        let index = self.advance();
        &self.identities[index]
    }

    /// Skips one identity without using it
    pub fn rotate(&self) {
        let skipped = self.advance();
        tracing::debug!("Rotated away from identity {}", self.identities[skipped]);
    }

    /// The identity the next call to `next` will return
    pub fn current(&self) -> &ProxyIdentity {
        &self.identities[self.cursor.load(Ordering::Acquire)]
    }

    pub fn identities(&self) -> &[ProxyIdentity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Moves the cursor one step and returns its previous position
    fn advance(&self) -> usize {
        let len = self.identities.len();
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

impl Default for ProxyRotator {
    fn default() -> Self {
        Self::from_config(&IdentityConfig::default())
    }
}

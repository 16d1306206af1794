//! Integration tests for the ingestion engine
//!
//! These tests use wiremock to stand in for the upstream site and tempfile
//! for the dataset, checkpoint and snapshot files.

mod fetch_tests;
mod merge_tests;
mod pipeline_tests;

use std::sync::Arc;
use std::time::Duration;
use tidemark::config::FetchConfig;
use tidemark::fetch::{ProxyRotator, RateLimiter, ResilientFetcher, RetryPolicy};
use tidemark::MetricsRegistry;

/// Creates a fetcher with fast retries and an effectively unlimited bucket
pub fn create_test_fetcher(
    user_agents: &[&str],
    max_attempts: u32,
    metrics: Arc<MetricsRegistry>,
) -> ResilientFetcher {
    let config = FetchConfig {
        timeout_seconds: 5,
        ..FetchConfig::default()
    };

    ResilientFetcher::new(
        &config,
        Arc::new(ProxyRotator::new(
            Vec::new(),
            user_agents.iter().map(|ua| ua.to_string()).collect(),
        )),
        Arc::new(RateLimiter::new(1000.0, 100).expect("Failed to build limiter")),
        RetryPolicy::new(max_attempts, Duration::from_millis(5), Duration::from_millis(20)),
        metrics,
    )
    .expect("Failed to build test fetcher")
}

/// A listing page with one `div.item` per (id, name) pair
pub fn listing_page(items: &[(&str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(id, name)| format!(r#"<div class="item" data-id="{}"><h2>{}</h2></div>"#, id, name))
        .collect();
    format!("<html><body>{}</body></html>", body)
}

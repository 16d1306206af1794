use crate::create_test_fetcher;
use std::sync::Arc;
use tidemark::fetch::FetchStatus;
use tidemark::{FetchError, MetricsRegistry};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_retries_after_throttling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/page/1"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&mock_server)
        .await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let fetcher = create_test_fetcher(&["agent-a"], 3, metrics.clone());
    let url = format!("{}/page/1", mock_server.uri());

    let result = fetcher.fetch_url(&url).await;

    assert_eq!(result.status, FetchStatus::Success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.payload.as_deref(), Some(&b"<html>ok</html>"[..]));
    assert_eq!(result.http_status, Some(200));
    assert_eq!(metrics.counter("fetch.attempts"), 2);
    assert_eq!(metrics.counter("fetch.blocked"), 1);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let fetcher = create_test_fetcher(&["agent-a"], 3, metrics.clone());

    let result = fetcher
        .fetch_url(&format!("{}/flaky", mock_server.uri()))
        .await;

    // Retried up to the limit, then the last failure is surfaced
    assert_eq!(result.status, FetchStatus::TransientError);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.http_status, Some(503));
    assert!(matches!(result.error, Some(FetchError::Transient { .. })));
    assert_eq!(metrics.counter("fetch.transient"), 3);
    assert!(result.payload.is_none());
}

#[tokio::test]
async fn test_block_marker_rotates_identity() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/item"))
        .and(header("user-agent", "agent-a"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html>Enter the CAPTCHA below</html>"),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/item"))
        .and(header("user-agent", "agent-b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>item</html>"))
        .mount(&mock_server)
        .await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let fetcher = create_test_fetcher(&["agent-a", "agent-b"], 3, metrics.clone());

    let result = fetcher
        .fetch_url(&format!("{}/item", mock_server.uri()))
        .await;

    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(result.identity_used.user_agent, "agent-b");
    assert!(result.identity_used.is_direct());
    assert_eq!(metrics.counter("fetch.blocked"), 1);
}

#[tokio::test]
async fn test_not_found_is_fatal_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let fetcher = create_test_fetcher(&["agent-a"], 5, metrics.clone());

    let result = fetcher
        .fetch_url(&format!("{}/missing", mock_server.uri()))
        .await;

    assert_eq!(result.status, FetchStatus::FatalError);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.http_status, Some(404));
    assert_eq!(metrics.counter("fetch.fatal"), 1);
}

#[tokio::test]
async fn test_forbidden_status_is_blocked() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/denied"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let fetcher = create_test_fetcher(&["agent-a"], 2, Arc::new(MetricsRegistry::new(10)));

    let result = fetcher
        .fetch_url(&format!("{}/denied", mock_server.uri()))
        .await;

    assert_eq!(result.status, FetchStatus::Blocked);
    assert_eq!(result.attempts, 2);
    assert!(result.error.as_ref().is_some_and(FetchError::is_blocked));
}

#[tokio::test]
async fn test_short_redirect_chain_is_followed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved here"))
        .mount(&mock_server)
        .await;

    let fetcher = create_test_fetcher(&["agent-a"], 1, Arc::new(MetricsRegistry::new(10)));

    let result = fetcher
        .fetch_url(&format!("{}/old", mock_server.uri()))
        .await;

    assert!(result.is_success());
    assert_eq!(result.final_url, Some(format!("{}/new", mock_server.uri())));
    assert_eq!(result.payload.as_deref(), Some(&b"moved here"[..]));
}

#[tokio::test]
async fn test_long_redirect_chain_is_blocked() {
    let mock_server = MockServer::start().await;

    for hop in 0..4 {
        let next = format!("/hop/{}", hop + 1);
        Mock::given(method("GET"))
            .and(path(format!("/hop/{}", hop)))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", next.as_str()))
            .mount(&mock_server)
            .await;
    }

    let fetcher = create_test_fetcher(&["agent-a"], 1, Arc::new(MetricsRegistry::new(10)));

    let result = fetcher
        .fetch_url(&format!("{}/hop/0", mock_server.uri()))
        .await;

    assert_eq!(result.status, FetchStatus::Blocked);
    assert_eq!(result.attempts, 1);
}

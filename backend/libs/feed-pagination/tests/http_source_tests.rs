/// HTTP page source against a mock feed API
mod common;

use common::*;
use feed_pagination::{
    Cursor, FeedConfig, FeedError, FeedItem, FetchOutcome, FetchScheduler, HttpPageSource, Page, PageRequest,
    PageSource, PagedCacheManager, SchedulePhase,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn source(server: &MockServer) -> HttpPageSource {
    init_tracing();
    HttpPageSource::new(&format!("{}/api/v2", server.uri()), Duration::from_secs(2))
        .unwrap()
        .with_bearer_token("session-token")
}

#[tokio::test]
async fn test_first_page_request() {
    let server = MockServer::start().await;
    let cursor = Cursor::from_key(&post(24).sort_key());

    Mock::given(method("GET"))
        .and(path("/api/v2/feeds/global"))
        .and(query_param("limit", "2"))
        .and(query_param_is_missing("cursor"))
        .and(header("authorization", "Bearer session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [post(25), post(24)],
            "next_cursor": cursor,
            "has_more": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = source(&server).await;
    let request = PageRequest::new(global(), None, 2).unwrap();
    let page: Page<Post> = source.fetch_page(&request).await.unwrap();

    assert_eq!(page.items(), &[post(25), post(24)]);
    assert_eq!(page.next_cursor(), Some(&cursor));
    assert!(page.has_more());
}

#[tokio::test]
async fn test_cache_walks_cursors_over_http() {
    let server = MockServer::start().await;
    let cursor = Cursor::from_key(&post(2).sort_key());

    Mock::given(method("GET"))
        .and(path("/api/v2/feeds/global"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [post(3), post(2)],
            "next_cursor": cursor,
            "has_more": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v2/feeds/global"))
        .and(query_param("cursor", cursor.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [post(1)],
            "next_cursor": null,
            "has_more": false,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache = PagedCacheManager::<Post, _>::new(source(&server).await, config(2));
    cache.fetch_next_page(&global()).await.unwrap();
    let outcome = cache.fetch_next_page(&global()).await.unwrap();
    assert_eq!(outcome, FetchOutcome::Appended { items: 1, has_more: false });

    let view = cache.get_flattened_view(&global()).unwrap();
    assert_eq!(numbers(&view), vec![3, 2, 1]);
}

#[tokio::test]
async fn test_inconsistent_page_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [post(1)],
            "next_cursor": null,
            "has_more": true,
        })))
        .mount(&server)
        .await;

    let source = source(&server).await;
    let request = PageRequest::new(global(), None, 10).unwrap();
    let result: feed_pagination::Result<Page<Post>> = source.fetch_page(&request).await;
    let err = result.unwrap_err();
    assert!(matches!(err, FeedError::MalformedPage(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_oversized_page_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [post(3), post(2), post(1)],
            "next_cursor": null,
            "has_more": false,
        })))
        .mount(&server)
        .await;

    let source = source(&server).await;
    let request = PageRequest::new(global(), None, 2).unwrap();
    let err = PageSource::<Post>::fetch_page(&source, &request).await.unwrap_err();
    assert!(matches!(err, FeedError::MalformedPage(_)));
}

#[tokio::test]
async fn test_malformed_page_is_not_retried_by_scheduler() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_cursor": null,
            "has_more": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = FeedConfig {
        retry_attempts: 3,
        retry_backoff_ms: 10,
        ..config(10)
    };
    let cache = Arc::new(PagedCacheManager::<Post, _>::new(source(&server).await, config));
    let scheduler = FetchScheduler::new(cache).unwrap();
    scheduler.register(global());

    let err = scheduler.retry_now(&global()).await.unwrap_err();
    assert!(matches!(err, FeedError::MalformedPage(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(scheduler.phase(&global()), Some(SchedulePhase::Idle));
}

#[tokio::test]
async fn test_status_mapping() {
    let cases: [(u16, serde_json::Value, &str); 6] = [
        (410, json!({}), "invalid_cursor"),
        (400, json!({ "code": "invalid_cursor", "message": "cursor expired" }), "invalid_cursor"),
        (400, json!({ "code": "bad_limit" }), "bad_request"),
        (403, json!({}), "bad_request"),
        (429, json!({}), "unavailable"),
        (503, json!({ "message": "maintenance" }), "unavailable"),
    ];

    for (status, body, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;

        let source = source(&server).await;
        let request = PageRequest::new(global(), None, 10).unwrap();
        let err = PageSource::<Post>::fetch_page(&source, &request).await.unwrap_err();

        let kind = match &err {
            FeedError::InvalidCursor(_) => "invalid_cursor",
            FeedError::BadRequest(_) => "bad_request",
            FeedError::SourceUnavailable { .. } => "unavailable",
            other => panic!("unexpected error for {}: {:?}", status, other),
        };
        assert_eq!(kind, expected, "status {}", status);
        assert_eq!(err.is_retryable(), expected == "unavailable");
    }
}

#[tokio::test]
async fn test_unreachable_server_is_retryable() {
    init_tracing();
    let source = HttpPageSource::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
    let request = PageRequest::new(global(), None, 10).unwrap();

    let err = PageSource::<Post>::fetch_page(&source, &request).await.unwrap_err();
    assert!(err.is_retryable());
}

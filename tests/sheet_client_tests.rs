//! Sheet client plumbing: the shared rate limiter decorator and its
//! penalty behavior around quota errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use sheetsync::error::SyncError;
use sheetsync::sheet::client::{list_all, RateLimitedSheet, SheetClient};
use sheetsync::sheet::mock::MockSheetClient;
use sheetsync::sheet::rate_limit::TokenBucket;

fn fields(raw: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    raw.as_object().unwrap().clone()
}

#[tokio::test]
async fn rate_limiter_passes_calls_through() {
    let mock = Arc::new(MockSheetClient::new());
    mock.seed("r1", fields(json!({"Name": "a"})));
    let bucket = Arc::new(TokenBucket::new(100));
    let limited = RateLimitedSheet::new(Arc::clone(&mock), bucket);

    let page = limited.list_records("db", "t", None).await.unwrap();
    assert_eq!(page.records.len(), 1);

    let id = limited
        .create_record("db", "t", &fields(json!({"Name": "b"})))
        .await
        .unwrap();
    assert_eq!(id, "mock-1");
    assert_eq!(mock.writes().len(), 1);
}

#[tokio::test]
async fn quota_breach_halves_the_shared_rate() {
    let mock = Arc::new(MockSheetClient::new());
    let bucket = Arc::new(TokenBucket::new(10));
    let limited = RateLimitedSheet::new(Arc::clone(&mock), Arc::clone(&bucket));

    mock.set_rate_limited(true);
    let err = limited.list_records("db", "t", None).await.unwrap_err();
    assert!(matches!(err, SyncError::RateLimited { .. }));
    assert_eq!(bucket.current_qps(), 5.0);
}

#[tokio::test]
async fn recovery_after_rate_limit_clears() {
    let mock = Arc::new(MockSheetClient::new());
    mock.seed("r1", fields(json!({"Name": "a"})));
    // Generous bucket so the penalty block (1 s Retry-After from the mock)
    // is the only delay in play; skip waiting it out by using a fresh bucket
    let bucket = Arc::new(TokenBucket::new(100));
    let limited = RateLimitedSheet::new(Arc::clone(&mock), bucket);

    mock.set_rate_limited(true);
    assert!(limited.list_records("db", "t", None).await.is_err());
    mock.set_rate_limited(false);

    // The mock reported Retry-After 1s; the next call waits it out and
    // then succeeds
    let start = Instant::now();
    let page = limited.list_records("db", "t", None).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn list_all_crosses_pages_under_rate_limiting() {
    let mock = MockSheetClient::with_page_size(3);
    for i in 0..7 {
        mock.seed(&format!("r{}", i), fields(json!({"Name": i.to_string()})));
    }
    let bucket = Arc::new(TokenBucket::new(50));
    let limited = RateLimitedSheet::new(mock, bucket);

    let all = list_all(&limited, "db", "t").await.unwrap();
    assert_eq!(all.len(), 7);
}

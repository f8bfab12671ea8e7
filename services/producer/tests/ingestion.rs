use logflow_pipeline::{MemoryBroker, TopicConfig};
use logflow_producer::{create_router, AppState, BucketLimiter};
use std::sync::Arc;
use tokio_test::assert_ok;

const BODY: &str = r#"{"_ctx": {"kafka_topic": "app"}, "message": "hello"}"#;

async fn post_many(url: &str, count: usize) -> Vec<u16> {
    let client = reqwest::Client::new();
    let mut statuses = Vec::with_capacity(count);
    for _ in 0..count {
        let resp = assert_ok!(client.post(url).body(BODY).send().await);
        statuses.push(resp.status().as_u16());
    }
    statuses
}

#[tokio::test]
async fn test_window_admits_four_of_five_until_refill() {
    let broker = MemoryBroker::new();
    let limiter = Arc::new(BucketLimiter::new(5));

    let state = AppState::new(
        Arc::new(broker.clone()),
        limiter.clone(),
        TopicConfig::default(),
        false,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    let url = format!("http://{addr}/produce");

    let first = post_many(&url, 6).await;
    assert_eq!(first, vec![200, 200, 200, 200, 429, 429]);

    // window tick
    limiter.refill();
    let second = post_many(&url, 5).await;
    assert_eq!(second, vec![200, 200, 200, 200, 429]);

    assert_eq!(broker.messages("app_logs").len(), 8);
    assert!(broker.messages("new_topic_events").is_empty());
}

mod common;

use common::{supervisor, timber_body, wait_until, RecordingStore};
use logflow_consumer::SupervisorState;
use logflow_pipeline::{
    ConsumerError, IncomingMessage, MemoryBroker, MessageMetadata, StartOffset,
};
use std::sync::Arc;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_existing_topics_are_consumed_from_newest() {
    let broker = MemoryBroker::new();
    broker.publish_raw("app_logs", timber_body("app", "before start"));
    broker.create_topic("billing_logs");
    broker.create_topic("metrics");

    let store = Arc::new(RecordingStore::default());
    let supervisor = supervisor(&broker, store.clone());
    assert_ok!(supervisor.start().await);

    let mut topics: Vec<String> = supervisor.worker_map().await.into_keys().collect();
    topics.sort();
    assert_eq!(topics, vec!["app_logs", "billing_logs"]);

    broker.publish_raw("app_logs", timber_body("app", "after start"));
    let s = store.as_ref();
    wait_until(|| async move { s.stored().len() == 1 }).await;

    assert_eq!(store.stored()[0].fields()["message"], "after start");
    supervisor.close().await;
}

#[tokio::test]
async fn test_control_message_spawns_worker_from_oldest() {
    let broker = MemoryBroker::new();
    let store = Arc::new(RecordingStore::default());
    let supervisor = supervisor(&broker, store.clone());
    assert_ok!(supervisor.start().await);
    assert!(supervisor.worker_map().await.is_empty());

    broker.publish_raw("new-app-logs", timber_body("new-app-logs", "written early"));
    broker.publish_raw("new_topic_events", "new-app-logs");

    let sup = &supervisor;
    wait_until(|| async move { sup.worker_map().await.contains_key("new-app-logs") }).await;

    let records = broker.consumers_for("new-app-logs");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offset, StartOffset::Oldest);
    assert_eq!(records[0].group_id, "logflow-consumer");

    let s = store.as_ref();
    wait_until(|| async move { s.stored().len() == 1 }).await;
    assert_eq!(store.stored()[0].fields()["message"], "written early");

    supervisor.close().await;
}

#[tokio::test]
async fn test_duplicate_announcements_spawn_one_worker() {
    let broker = MemoryBroker::new();
    let store = Arc::new(RecordingStore::default());
    let supervisor = supervisor(&broker, store);
    assert_ok!(supervisor.start().await);

    for _ in 0..3 {
        broker.publish_raw("new_topic_events", "shop_logs");
    }
    broker.publish_raw("new_topic_events", "marker_logs");

    let sup = &supervisor;
    wait_until(|| async move { sup.worker_map().await.contains_key("marker_logs") }).await;

    assert_eq!(broker.consumers_for("shop_logs").len(), 1);
    assert_eq!(supervisor.worker_map().await.len(), 2);
    supervisor.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_new_topic_events_spawn_one_worker() {
    let broker = MemoryBroker::new();
    let supervisor = supervisor(&broker, Arc::new(RecordingStore::default()));
    assert_ok!(supervisor.start().await);

    let event = IncomingMessage {
        payload: b"burst_logs".to_vec(),
        metadata: MessageMetadata {
            topic: "new_topic_events".to_string(),
            ..Default::default()
        },
    };

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..32 {
        let supervisor = supervisor.clone();
        let event = event.clone();
        tasks.spawn(async move { supervisor.on_new_topic_event(event).await });
    }
    while let Some(joined) = tasks.join_next().await {
        assert_ok!(joined);
    }

    assert_eq!(broker.consumers_for("burst_logs").len(), 1);
    assert_eq!(broker.live_subscriptions("burst_logs"), 1);
    assert_eq!(supervisor.worker_map().await.len(), 1);

    supervisor.close().await;
}

#[tokio::test]
async fn test_delivery_errors_are_recorded_not_fatal() {
    let broker = MemoryBroker::new();
    broker.create_topic("app_logs");
    let store = Arc::new(RecordingStore::default());
    let supervisor = supervisor(&broker, store.clone());
    assert_ok!(supervisor.start().await);

    broker.inject_error(
        "app_logs",
        ConsumerError::DeliveryError("partition leader moved".to_string()),
    );
    broker.publish_raw("app_logs", timber_body("app", "still flowing"));

    let s = store.as_ref();
    wait_until(|| async move { s.stored().len() == 1 }).await;
    assert!(supervisor
        .last_error()
        .unwrap()
        .contains("partition leader moved"));
    assert_eq!(supervisor.state().await, SupervisorState::Running);

    supervisor.close().await;
}

#[tokio::test]
async fn test_persistent_store_failure_halts_then_resumes() {
    let broker = MemoryBroker::new();
    broker.create_topic("app_logs");
    let store = Arc::new(RecordingStore::default());
    store.set_failing(true);
    let supervisor = supervisor(&broker, store.clone());
    assert_ok!(supervisor.start().await);

    broker.publish_raw("app_logs", timber_body("app", "lost"));

    let sup = &supervisor;
    wait_until(|| async move { sup.state().await == SupervisorState::Halted }).await;

    assert_eq!(store.attempts(), 3);
    for worker in supervisor.worker_map().await.values() {
        assert!(worker.is_stopped());
    }
    assert!(supervisor.new_topic_event_worker().await.unwrap().is_stopped());
    assert_eq!(broker.open_admins(), 0);
    let b = &broker;
    wait_until(|| async move { b.live_subscriptions("app_logs") == 0 }).await;

    // announcements while halted are dropped
    broker.publish_raw("new_topic_events", "ignored_logs");
    assert!(broker.consumers_for("ignored_logs").is_empty());

    store.set_failing(false);
    assert_ok!(supervisor.resume_worker().await);
    assert_eq!(supervisor.state().await, SupervisorState::Running);

    broker.publish_raw("app_logs", timber_body("app", "after resume"));
    let s = store.as_ref();
    wait_until(|| async move { s.stored().len() == 1 }).await;
    assert_eq!(store.stored()[0].fields()["message"], "after resume");
    assert_eq!(broker.live_subscriptions("app_logs"), 1);

    supervisor.close().await;
}

#[tokio::test]
async fn test_close_stops_everything() {
    let broker = MemoryBroker::new();
    broker.create_topic("app_logs");
    broker.create_topic("web_logs");
    let supervisor = supervisor(&broker, Arc::new(RecordingStore::default()));
    assert_ok!(supervisor.start().await);

    supervisor.close().await;

    for worker in supervisor.worker_map().await.values() {
        assert!(!worker.is_running());
    }
    assert_eq!(broker.live_subscriptions("app_logs"), 0);
    assert_eq!(broker.live_subscriptions("new_topic_events"), 0);
    assert_eq!(broker.open_admins(), 0);
}

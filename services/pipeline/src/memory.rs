//! In-process broker for tests and local runs.
//!
//! Topics are append-only vectors. Each message is delivered once per
//! consumer group, to the first live member of that group. Publishing to an
//! unknown topic creates it, like a broker with `auto.create.topics.enable`.
//! Failure injection hooks let tests exercise the retry paths.

use crate::admin::{AdminError, KafkaAdmin, KafkaFactory};
use crate::consumer::{ConsumerError, IncomingMessage, MessageMetadata, StartOffset, Subscription};
use crate::producer::{DeliveryResult, OutgoingMessage, ProducerError, Publisher};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Delivery = Result<IncomingMessage, ConsumerError>;

/// A consumer created through the factory
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub group_id: String,
    pub topic: String,
    pub offset: StartOffset,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<IncomingMessage>>,
    subscribers: Vec<Subscriber>,
    consumers: Vec<ConsumerRecord>,
    admin_failures: u32,
    failing_topic_listing: bool,
    admins_opened: usize,
    admins_closed: usize,
    failing_consumer_topics: HashSet<String>,
    failing_publish_topics: HashSet<String>,
}

struct Subscriber {
    group_id: String,
    topic: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str) {
        self.state.lock().topics.entry(topic.to_string()).or_default();
    }

    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.keys().cloned().collect()
    }

    /// Messages appended to `topic` so far
    pub fn messages(&self, topic: &str) -> Vec<IncomingMessage> {
        self.state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Append `payload` to `topic` and deliver it to every consumer group
    pub fn publish_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> DeliveryResult {
        self.append(topic, payload.into(), HashMap::new())
    }

    fn append(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> DeliveryResult {
        let mut state = self.state.lock();
        let log = state.topics.entry(topic.to_string()).or_default();
        let message = IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: topic.to_string(),
                partition: 0,
                offset: log.len() as i64,
                headers,
                ..Default::default()
            },
        };
        log.push(message.clone());
        state.deliver(topic, Ok(message.clone()));

        DeliveryResult {
            topic: topic.to_string(),
            partition: message.metadata.partition,
            offset: message.metadata.offset,
        }
    }

    /// Deliver a consumer error to every group subscribed to `topic`
    pub fn inject_error(&self, topic: &str, error: ConsumerError) {
        self.state.lock().deliver(topic, Err(error));
    }

    /// Make the next `count` admin connections fail
    pub fn fail_admin(&self, count: u32) {
        self.state.lock().admin_failures = count;
    }

    /// Make topic listing through any admin handle fail until cleared
    pub fn fail_topic_listing(&self) {
        self.state.lock().failing_topic_listing = true;
    }

    /// Make consumer creation for `topic` fail until cleared
    pub fn fail_consumers_for(&self, topic: &str) {
        self.state
            .lock()
            .failing_consumer_topics
            .insert(topic.to_string());
    }

    /// Make publishing to `topic` fail until cleared
    pub fn fail_publish_to(&self, topic: &str) {
        self.state
            .lock()
            .failing_publish_topics
            .insert(topic.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.admin_failures = 0;
        state.failing_topic_listing = false;
        state.failing_consumer_topics.clear();
        state.failing_publish_topics.clear();
    }

    /// Every consumer created so far, in creation order
    pub fn consumers(&self) -> Vec<ConsumerRecord> {
        self.state.lock().consumers.clone()
    }

    pub fn consumers_for(&self, topic: &str) -> Vec<ConsumerRecord> {
        self.consumers()
            .into_iter()
            .filter(|c| c.topic == topic)
            .collect()
    }

    /// Number of subscriptions that are still open on `topic`
    pub fn live_subscriptions(&self, topic: &str) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.subscribers.iter().filter(|s| s.topic == topic).count()
    }

    /// Admin handles opened and not yet closed
    pub fn open_admins(&self) -> usize {
        let state = self.state.lock();
        state.admins_opened - state.admins_closed
    }
}

impl BrokerState {
    fn prune(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
    }

    fn deliver(&mut self, topic: &str, delivery: Delivery) {
        self.prune();
        let mut served_groups = HashSet::new();
        for subscriber in self.subscribers.iter().filter(|s| s.topic == topic) {
            if served_groups.insert(subscriber.group_id.clone()) {
                let _ = subscriber.tx.send(delivery.clone());
            }
        }
    }
}

#[async_trait]
impl KafkaFactory for MemoryBroker {
    async fn make_admin(&self) -> Result<Box<dyn KafkaAdmin>, AdminError> {
        let mut state = self.state.lock();
        if state.admin_failures > 0 {
            state.admin_failures -= 1;
            return Err(AdminError::ConnectionError(
                "memory broker unavailable".to_string(),
            ));
        }
        state.admins_opened += 1;

        Ok(Box::new(MemoryAdmin {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn make_consumer(
        &self,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Box<dyn Subscription>, ConsumerError> {
        let mut state = self.state.lock();
        if state.failing_consumer_topics.contains(topic) {
            return Err(ConsumerError::CreationError(format!(
                "memory broker refused consumer for {topic}"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if offset == StartOffset::Oldest {
            for message in state.topics.get(topic).into_iter().flatten() {
                let _ = tx.send(Ok(message.clone()));
            }
        }

        state.subscribers.push(Subscriber {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            tx,
        });
        state.consumers.push(ConsumerRecord {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            offset,
        });

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx,
        }))
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        if self
            .state
            .lock()
            .failing_publish_topics
            .contains(&message.topic)
        {
            return Err(ProducerError::SendError {
                topic: message.topic,
                message: "memory broker refused message".to_string(),
            });
        }
        let headers = message.headers.into_iter().collect();
        Ok(self.append(&message.topic, message.payload, headers))
    }
}

struct MemoryAdmin {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl KafkaAdmin for MemoryAdmin {
    async fn topics(&self) -> Result<Vec<String>, AdminError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdminError::Closed);
        }
        if self.broker.state.lock().failing_topic_listing {
            return Err(AdminError::MetadataError(
                "memory broker metadata unavailable".to_string(),
            ));
        }
        Ok(self.broker.topics())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.state.lock().admins_closed += 1;
        }
    }
}

struct MemorySubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_newest_sees_only_new_messages() {
        let broker = MemoryBroker::new();
        broker.publish_raw("app_logs", "old");

        let mut sub = broker
            .make_consumer("g", "app_logs", StartOffset::Newest)
            .await
            .unwrap();
        broker.publish_raw("app_logs", "new");

        let message = sub.recv().await.unwrap().unwrap();
        assert_eq!(message.payload_str(), Some("new"));
        assert_eq!(message.metadata.offset, 1);
    }

    #[tokio::test]
    async fn test_oldest_replays_history() {
        let broker = MemoryBroker::new();
        broker.publish_raw("app_logs", "first");
        broker.publish_raw("app_logs", "second");

        let mut sub = broker
            .make_consumer("g", "app_logs", StartOffset::Oldest)
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().unwrap().payload_str(), Some("first"));
        assert_eq!(sub.recv().await.unwrap().unwrap().payload_str(), Some("second"));
    }

    #[tokio::test]
    async fn test_one_delivery_per_group() {
        let broker = MemoryBroker::new();
        let mut a1 = broker.make_consumer("a", "t", StartOffset::Newest).await.unwrap();
        let mut a2 = broker.make_consumer("a", "t", StartOffset::Newest).await.unwrap();
        let mut b = broker.make_consumer("b", "t", StartOffset::Newest).await.unwrap();

        broker.publish_raw("t", "x");

        assert!(a1.recv().await.unwrap().is_ok());
        assert!(b.recv().await.unwrap().is_ok());
        a2.close().await;
        assert!(a2.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_subscription_is_pruned() {
        let broker = MemoryBroker::new();
        let mut sub = broker.make_consumer("g", "t", StartOffset::Newest).await.unwrap();
        assert_eq!(broker.live_subscriptions("t"), 1);

        sub.close().await;
        assert_eq!(broker.live_subscriptions("t"), 0);
    }

    #[tokio::test]
    async fn test_admin_failures_and_close() {
        let broker = MemoryBroker::new();
        broker.create_topic("app_logs");
        broker.fail_admin(1);

        assert!(broker.make_admin().await.is_err());
        let admin = broker.make_admin().await.unwrap();
        assert_eq!(assert_ok!(admin.topics().await), vec!["app_logs".to_string()]);
        assert_eq!(broker.open_admins(), 1);

        admin.close().await;
        admin.close().await;
        assert_eq!(broker.open_admins(), 0);
        assert!(matches!(admin.topics().await, Err(AdminError::Closed)));
    }

    #[tokio::test]
    async fn test_topic_listing_failure() {
        let broker = MemoryBroker::new();
        let admin = broker.make_admin().await.unwrap();
        broker.fail_topic_listing();
        assert!(matches!(
            admin.topics().await,
            Err(AdminError::MetadataError(_))
        ));

        broker.clear_failures();
        assert_ok!(admin.topics().await);
    }

    #[tokio::test]
    async fn test_publish_keeps_headers() {
        let broker = MemoryBroker::new();
        let message = OutgoingMessage::new("app_logs", b"x".to_vec()).with_header("source", "http");
        assert_ok!(broker.publish(message).await);

        let stored = broker.messages("app_logs");
        assert_eq!(stored[0].header("source"), Some("http"));
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let broker = MemoryBroker::new();
        broker.fail_publish_to("app_logs");

        let result = broker
            .publish(OutgoingMessage::new("app_logs", b"x".to_vec()))
            .await;
        assert_err!(&result);
        assert!(matches!(result, Err(ProducerError::SendError { .. })));
        assert!(broker.messages("app_logs").is_empty());

        broker.clear_failures();
        let delivered = broker
            .publish(OutgoingMessage::new("app_logs", b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(delivered.offset, 0);
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use logflow_consumer::{StoreError, Supervisor, SupervisorSettings, TimberStore};
use logflow_pipeline::{MemoryBroker, Timber, TopicConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store that keeps every Timber it is given and can be switched to failing
#[derive(Default)]
pub struct RecordingStore {
    stored: Mutex<Vec<Timber>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingStore {
    pub fn stored(&self) -> Vec<Timber> {
        self.stored.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimberStore for RecordingStore {
    async fn store(&self, timber: &Timber) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                status: 503,
                body: "cluster_block_exception".to_string(),
            });
        }
        self.stored.lock().push(timber.clone());
        Ok(())
    }
}

pub fn settings() -> SupervisorSettings {
    SupervisorSettings {
        group_id: "logflow-consumer".to_string(),
        topics: TopicConfig::default(),
        kafka_max_retry: 3,
        kafka_retry_interval: Duration::from_millis(1),
        store_max_retry: 3,
        store_retry_interval: Duration::from_millis(1),
    }
}

pub fn supervisor(broker: &MemoryBroker, store: Arc<RecordingStore>) -> Supervisor {
    Supervisor::new(Arc::new(broker.clone()), store, settings())
}

pub fn timber_body(topic: &str, message: &str) -> String {
    serde_json::json!({
        "_ctx": {"kafka_topic": topic},
        "message": message,
    })
    .to_string()
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

//! Consumer supervisor.
//!
//! Owns one [`Worker`] per log topic plus a control worker listening on the
//! new-topic event topic. Topics present at startup are consumed from the
//! newest offset; topics announced later are consumed from the oldest offset
//! so nothing written before the announcement is lost.
//!
//! Every store write goes through a [`Retrier`]. When a write exhausts its
//! retry budget the supervisor halts all workers until [`Supervisor::resume_worker`]
//! is called.

use crate::config::Config;
use crate::retrier::Retrier;
use crate::store::TimberStore;
use async_trait::async_trait;
use logflow_pipeline::{
    AdminError, ConsumerError, IncomingMessage, KafkaAdmin, KafkaFactory, MessageHandler,
    StartOffset, Timber, TopicConfig, Worker, SOURCE_HEADER,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Group id prefix of the per-process control topic consumer
pub const EVENT_GROUP_PREFIX: &str = "nte";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Kafka admin retry limit reached after {attempts} attempts: {source}")]
    RetryLimitReached {
        attempts: u32,
        #[source]
        source: AdminError,
    },

    #[error("Make new topic worker failed: {0}")]
    NewTopicWorker(#[source] ConsumerError),

    #[error("Failed to list topics: {0}")]
    ListTopics(#[source] AdminError),

    #[error("Spawn worker for {topic} failed: {source}")]
    SpawnWorker {
        topic: String,
        #[source]
        source: ConsumerError,
    },

    #[error("Consumer workers are halted")]
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Initializing,
    Running,
    Halted,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Shared group id of the log topic consumers
    pub group_id: String,
    pub topics: TopicConfig,
    /// Admin connection attempts (0 = forever)
    pub kafka_max_retry: u32,
    pub kafka_retry_interval: Duration,
    /// Store attempts per document (0 = forever)
    pub store_max_retry: u32,
    pub store_retry_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            group_id: config.kafka.consumer.group_id.clone(),
            topics: config.kafka.topics.clone(),
            kafka_max_retry: config.supervisor.kafka_max_retry,
            kafka_retry_interval: config.kafka_retry_interval(),
            store_max_retry: config.elasticsearch.retrier_max_retry,
            store_retry_interval: config.retrier_interval(),
        }
    }
}

/// Cloning yields another handle to the same supervisor
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn KafkaFactory>,
    store: Arc<dyn TimberStore>,
    retrier: Retrier,
    settings: SupervisorSettings,
    state: Mutex<State>,
    last_error: parking_lot::Mutex<Option<String>>,
    last_timber: parking_lot::Mutex<Option<Timber>>,
    last_new_topic: parking_lot::Mutex<Option<String>>,
}

struct State {
    phase: SupervisorState,
    workers: HashMap<String, Worker>,
    admin: Option<Box<dyn KafkaAdmin>>,
    event_worker: Option<Worker>,
    event_group_id: Option<String>,
}

impl State {
    /// Stop every worker and release the admin handle. Registry entries stay.
    async fn close(&mut self) {
        for worker in self.workers.values() {
            worker.stop();
        }
        if let Some(worker) = &self.event_worker {
            worker.stop();
        }
        if let Some(admin) = self.admin.take() {
            admin.close().await;
        }
    }

    fn accepts_new_topics(&self) -> bool {
        self.phase != SupervisorState::Halted
            && self.event_worker.as_ref().is_some_and(|w| !w.is_stopped())
    }
}

impl Supervisor {
    pub fn new(
        factory: Arc<dyn KafkaFactory>,
        store: Arc<dyn TimberStore>,
        settings: SupervisorSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_retry = weak.clone();
            let on_exhausted = weak.clone();

            let retrier = Retrier::new(settings.store_retry_interval, settings.store_max_retry)
                .on_retry(move |e| {
                    metrics::counter!("consumer_elasticsearch_client_failed", "phase" => "retry")
                        .increment(1);
                    if let Some(inner) = on_retry.upgrade() {
                        inner.log_error(format_args!("Elasticsearch client failed: {e}"));
                    }
                })
                .on_max_retry_reached(move || {
                    let weak = on_exhausted.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            Supervisor { inner }.halt_all_worker().await;
                        }
                    }
                });

            Inner {
                factory,
                store,
                retrier,
                settings,
                state: Mutex::new(State {
                    phase: SupervisorState::Initializing,
                    workers: HashMap::new(),
                    admin: None,
                    event_worker: None,
                    event_group_id: None,
                }),
                last_error: parking_lot::Mutex::new(None),
                last_timber: parking_lot::Mutex::new(None),
                last_new_topic: parking_lot::Mutex::new(None),
            }
        });

        Self { inner }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Connect, start the control worker and one worker per existing log topic.
    ///
    /// On failure the partially installed control worker and admin handle are
    /// released again.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let result = self.bootstrap().await;
        if let Err(e) = &result {
            self.unwind_start(SupervisorState::Initializing).await;
            error!(error = %e, "Consumer supervisor failed to start");
        }
        result
    }

    async fn bootstrap(&self) -> Result<(), SupervisorError> {
        let admin = self.acquire_admin().await?;

        let group_id = format!("{}-{}", EVENT_GROUP_PREFIX, Uuid::new_v4());
        info!(group_id = %group_id, "Generated new topic event group id");

        {
            let mut state = self.inner.state.lock().await;
            if let Some(previous) = state.admin.replace(admin) {
                previous.close().await;
            }
            state.event_group_id = Some(group_id.clone());
        }

        let event_worker = self.make_new_topic_worker(&group_id).await?;
        {
            let mut state = self.inner.state.lock().await;
            event_worker.start();
            if let Some(previous) = state.event_worker.replace(event_worker) {
                previous.stop();
            }
        }

        let listed = {
            let state = self.inner.state.lock().await;
            let listed = match &state.admin {
                Some(admin) => admin.topics().await,
                None => Err(AdminError::Closed),
            };
            listed
        };
        let topics = listed.map_err(|e| {
            self.inner.log_error(&e);
            SupervisorError::ListTopics(e)
        })?;

        let topic_config = &self.inner.settings.topics;
        for topic in topics.iter().filter(|t| topic_config.is_log_topic(t)) {
            let mut state = self.inner.state.lock().await;
            if state.workers.contains_key(topic) {
                continue;
            }
            if let Err(e) = self.spawn_locked(&mut state, topic, StartOffset::Newest).await {
                self.inner.log_error(&e);
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.phase == SupervisorState::Initializing {
            state.phase = SupervisorState::Running;
        }
        info!(workers = state.workers.len(), "Consumer supervisor started");

        Ok(())
    }

    /// Drop whatever a failed bootstrap left behind and settle on `phase`
    async fn unwind_start(&self, phase: SupervisorState) {
        let mut state = self.inner.state.lock().await;
        state.close().await;
        state.workers.clear();
        state.event_worker = None;
        state.event_group_id = None;
        state.phase = phase;
        metrics::gauge!("consumer_workers").set(0.0);
    }

    async fn acquire_admin(&self) -> Result<Box<dyn KafkaAdmin>, SupervisorError> {
        let max_retry = self.inner.settings.kafka_max_retry;
        let interval = self.inner.settings.kafka_retry_interval;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.factory.make_admin().await {
                Ok(admin) => {
                    if attempt > 1 {
                        info!(attempt, "Retry initialize kafka admin successful");
                    }
                    return Ok(admin);
                }
                Err(e) if max_retry != 0 && attempt >= max_retry => {
                    let err = SupervisorError::RetryLimitReached {
                        attempts: attempt,
                        source: e,
                    };
                    self.inner.log_error(&err);
                    return Err(err);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        "Cannot connect to kafka, retrying in {:?}",
                        interval
                    );
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn make_new_topic_worker(&self, group_id: &str) -> Result<Worker, SupervisorError> {
        let topic = &self.inner.settings.topics.new_topic_events;
        let subscription = self
            .inner
            .factory
            .make_consumer(group_id, topic, StartOffset::Newest)
            .await
            .map_err(|e| {
                self.inner.log_error(&e);
                SupervisorError::NewTopicWorker(e)
            })?;

        let handler = Arc::new(NewTopicEventHandler {
            supervisor: Arc::downgrade(&self.inner),
        });
        Ok(Worker::new(subscription, handler))
    }

    /// Start consuming `topic` with the shared group id and register the worker
    pub async fn spawn_logs_worker(
        &self,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Worker, SupervisorError> {
        let mut state = self.inner.state.lock().await;
        self.spawn_locked(&mut state, topic, offset).await
    }

    async fn spawn_locked(
        &self,
        state: &mut State,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Worker, SupervisorError> {
        if state.phase == SupervisorState::Halted {
            return Err(SupervisorError::Halted);
        }

        let subscription = self
            .inner
            .factory
            .make_consumer(&self.inner.settings.group_id, topic, offset)
            .await
            .map_err(|source| SupervisorError::SpawnWorker {
                topic: topic.to_string(),
                source,
            })?;

        let handler = Arc::new(StoreTimberHandler {
            supervisor: Arc::downgrade(&self.inner),
        });
        let worker = Worker::new(subscription, handler);
        worker.start();

        if let Some(previous) = state.workers.insert(topic.to_string(), worker.clone()) {
            previous.stop();
        }
        metrics::gauge!("consumer_workers").set(state.workers.len() as f64);
        debug!(topic = %topic, offset = offset.as_reset_policy(), "Spawned logs worker");

        Ok(worker)
    }

    /// Control topic callback: the payload is the name of a new log topic
    pub async fn on_new_topic_event(&self, message: IncomingMessage) {
        let Some(topic) = message.payload_str().filter(|t| !t.is_empty()) else {
            self.inner.log_error("New topic event without a valid topic name");
            return;
        };

        let mut state = self.inner.state.lock().await;
        if !state.accepts_new_topics() {
            debug!(topic = %topic, "Ignoring new topic event while stopped");
            return;
        }
        if state.workers.contains_key(topic) {
            return;
        }

        match self.spawn_locked(&mut state, topic, StartOffset::Oldest).await {
            Ok(_) => {
                drop(state);
                self.inner.log_new_topic(topic);
            }
            Err(e) => {
                drop(state);
                self.inner
                    .log_error(format_args!("Spawn worker on new topic failed: {e}"));
            }
        }
    }

    /// Log topic callback: convert and store one Timber
    pub async fn on_store_timber(&self, message: IncomingMessage) {
        let timber = match Timber::from_message(&message) {
            Ok(timber) => timber,
            Err(e) => {
                metrics::counter!("consumer_timbers_dropped", "reason" => "convert").increment(1);
                self.inner
                    .log_error(format_args!("Convert KafkaMessage failed: {e}"));
                return;
            }
        };

        let store = &self.inner.store;
        match self.inner.retrier.run(|| store.store(&timber)).await {
            Ok(()) => {
                metrics::counter!("consumer_timbers_stored").increment(1);
                self.inner.log_timber(timber, message.header(SOURCE_HEADER));
            }
            Err(e) => {
                metrics::counter!("consumer_timbers_dropped", "reason" => "store").increment(1);
                self.inner.log_error(format_args!("Store failed: {e}"));
            }
        }
    }

    /// Stop every worker and release the admin handle. Idempotent.
    ///
    /// Does not wait for the worker loops, so it is safe to call from a
    /// worker's own handler.
    pub async fn halt_all_worker(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase == SupervisorState::Halted {
            return;
        }

        state.phase = SupervisorState::Halted;
        metrics::counter!("consumer_halts").increment(1);
        error!(workers = state.workers.len(), "Consumer worker halted");
        *self.inner.last_error.lock() = Some("Consumer worker halted".to_string());

        state.close().await;
    }

    /// Leave the halted state and run the startup sequence again. A failed
    /// attempt returns to Halted so it can be retried.
    pub async fn resume_worker(&self) -> Result<(), SupervisorError> {
        {
            let mut state = self.inner.state.lock().await;
            state.phase = SupervisorState::Initializing;
            for (_, worker) in state.workers.drain() {
                worker.stop();
            }
            if let Some(worker) = state.event_worker.take() {
                worker.stop();
            }
        }

        info!("Resuming consumer workers");
        let result = self.bootstrap().await;
        if let Err(e) = &result {
            self.unwind_start(SupervisorState::Halted).await;
            error!(error = %e, "Resume failed, consumer workers stay halted");
        }
        result
    }

    /// Stop every worker, release the admin handle and wait for the loops
    pub async fn close(&self) {
        let workers: Vec<Worker> = {
            let mut state = self.inner.state.lock().await;
            state.close().await;
            state
                .workers
                .values()
                .cloned()
                .chain(state.event_worker.clone())
                .collect()
        };

        for worker in workers {
            worker.join().await;
        }
        info!("Consumer supervisor closed");
    }

    /// Snapshot of the worker registry
    pub async fn worker_map(&self) -> HashMap<String, Worker> {
        self.inner.state.lock().await.workers.clone()
    }

    pub async fn new_topic_event_worker(&self) -> Option<Worker> {
        self.inner.state.lock().await.event_worker.clone()
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.state.lock().await.phase
    }

    pub async fn event_group_id(&self) -> Option<String> {
        self.inner.state.lock().await.event_group_id.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn last_timber(&self) -> Option<Timber> {
        self.inner.last_timber.lock().clone()
    }

    pub fn last_new_topic(&self) -> Option<String> {
        self.inner.last_new_topic.lock().clone()
    }
}

impl Inner {
    fn log_error(&self, err: impl Display) {
        let message = err.to_string();
        warn!(error = %message, "Consumer error");
        *self.last_error.lock() = Some(message);
    }

    fn log_timber(&self, timber: Timber, source: Option<&str>) {
        debug!(
            index = %timber.index_name(),
            source = source.unwrap_or("unknown"),
            timber = ?timber,
            "Stored timber"
        );
        *self.last_timber.lock() = Some(timber);
    }

    fn log_new_topic(&self, topic: &str) {
        warn!(topic = %topic, "New topic");
        *self.last_new_topic.lock() = Some(topic.to_string());
    }
}

struct NewTopicEventHandler {
    supervisor: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for NewTopicEventHandler {
    async fn handle(&self, message: IncomingMessage) {
        if let Some(inner) = self.supervisor.upgrade() {
            Supervisor { inner }.on_new_topic_event(message).await;
        }
    }

    async fn on_error(&self, error: ConsumerError) {
        if let Some(inner) = self.supervisor.upgrade() {
            inner.log_error(error);
        }
    }
}

struct StoreTimberHandler {
    supervisor: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for StoreTimberHandler {
    async fn handle(&self, message: IncomingMessage) {
        if let Some(inner) = self.supervisor.upgrade() {
            Supervisor { inner }.on_store_timber(message).await;
        }
    }

    async fn on_error(&self, error: ConsumerError) {
        if let Some(inner) = self.supervisor.upgrade() {
            inner.log_error(error);
        }
    }
}

//! Per-topic consumption loop.

use crate::consumer::{MessageHandler, Subscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives one subscription until stopped.
///
/// Cloning a `Worker` yields another handle to the same loop.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(subscription: Box<dyn Subscription>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                topic: subscription.topic().to_string(),
                handler,
                subscription: Mutex::new(Some(subscription)),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Spawn the pull loop. Calling it again, or after `stop`, has no effect.
    pub fn start(&self) {
        if self.is_stopped() {
            return;
        }
        let Some(subscription) = self.inner.subscription.lock().take() else {
            return;
        };

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run(subscription).await;
        });
        *self.inner.task.lock() = Some(handle);
    }

    /// Signal the loop to end. Idempotent and non-blocking, so it may be
    /// called from inside the worker's own handler.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(topic = %self.inner.topic, "Stopping worker");
            self.inner.cancel.cancel();
        }
        // never started: release the idle subscription here
        if self.inner.subscription.lock().take().is_some() {
            self.inner.running.store(false, Ordering::SeqCst);
        }
    }

    /// Wait for the loop to finish after `stop`
    pub async fn join(&self) {
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(topic = %self.inner.topic, error = %e, "Worker task failed");
            }
        }
    }
}

impl WorkerInner {
    async fn run(&self, mut subscription: Box<dyn Subscription>) {
        info!(topic = %self.topic, "Starting worker loop");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(topic = %self.topic, "Worker received stop signal");
                    break;
                }
                next = subscription.recv() => {
                    match next {
                        Some(Ok(message)) => {
                            self.handler.handle(message.clone()).await;
                            if let Err(e) = subscription.commit(&message).await {
                                warn!(topic = %self.topic, error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            self.handler.on_error(e).await;
                        }
                        None => {
                            debug!(topic = %self.topic, "Subscription stream ended");
                            break;
                        }
                    }
                }
            }
        }

        subscription.close().await;
        self.running.store(false, Ordering::SeqCst);
        info!(topic = %self.topic, "Worker loop finished");
    }
}

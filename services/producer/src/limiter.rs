//! Fixed-window admission control for the ingestion endpoint.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Token bucket refilled to full capacity once per window.
///
/// Admission fails once the remaining count is down to 1, so a bucket of
/// `max_tps` admits `max_tps - 1` requests per window.
#[derive(Debug)]
pub struct BucketLimiter {
    max_tps: u32,
    tokens: Mutex<u32>,
}

impl BucketLimiter {
    pub fn new(max_tps: u32) -> Self {
        Self {
            max_tps,
            tokens: Mutex::new(max_tps),
        }
    }

    pub fn max_tps(&self) -> u32 {
        self.max_tps
    }

    /// Remaining tokens in the current window
    pub fn available(&self) -> u32 {
        *self.tokens.lock()
    }

    /// Take one token if the bucket allows it
    pub fn try_acquire(&self) -> bool {
        let mut tokens = self.tokens.lock();
        if *tokens <= 1 {
            return false;
        }
        *tokens -= 1;
        true
    }

    /// Reset to full capacity regardless of consumption
    pub fn refill(&self) {
        *self.tokens.lock() = self.max_tps;
    }

    /// Refill every `window` until `cancel` fires
    pub fn spawn_refill(
        self: &Arc<Self>,
        window: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => limiter.refill(),
                }
            }
            debug!("Bucket refill stopped");
        })
    }
}

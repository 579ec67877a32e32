//! Exponential-backoff reconnect scheduling.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Capped exponential-backoff scheduler for reconnect attempts.
///
/// Attempts are unlimited; whether a disconnect schedules a reconnect
/// at all is the session's `should_reconnect` decision, not this
/// manager's. A `schedule_reconnect` call while an attempt is already
/// pending is a no-op: the pending attempt covers it.
pub struct ReconnectionManager {
    config: ReconnectConfig,
    attempts: Arc<AtomicU32>,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: Arc::new(AtomicU32::new(0)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Backoff delay for a given attempt count: `initial * 2^attempts`,
    /// capped at `max_delay`.
    pub fn delay_for(config: &ReconnectConfig, attempts: u32) -> Duration {
        let exponent = attempts.min(16);
        let millis = (config.initial_delay.as_millis() as u64)
            .saturating_mul(1u64 << exponent)
            .min(config.max_delay.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Current attempt count.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Whether an attempt is currently pending.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Schedule one reconnect attempt after the current backoff delay.
    ///
    /// The task increments the attempt count, then invokes `connect`;
    /// a failure is logged and leaves the manager idle so the session's
    /// disconnect handler can schedule the next attempt. The pending
    /// slot is released before `connect` runs, so a failure handler
    /// inside the callback may schedule the follow-up attempt.
    pub fn schedule_reconnect<F, Fut, E>(&self, connect: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        let mut pending = self.pending.lock();
        if pending.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Reconnect already pending, ignoring");
            return;
        }

        let attempts = Arc::clone(&self.attempts);
        let slot = Arc::clone(&self.pending);
        let delay = Self::delay_for(&self.config, attempts.load(Ordering::Relaxed));

        let handle = tokio::spawn(async move {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            tokio::time::sleep(delay).await;
            *slot.lock() = None;
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if let Err(e) = connect().await {
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        });

        *pending = Some(handle);
    }

    /// Cancel any pending reconnect attempt.
    pub fn cancel_reconnect(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    /// Zero the attempt count; called after a successful connect.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}

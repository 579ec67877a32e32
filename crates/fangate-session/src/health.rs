//! Data-staleness detection for upstream sessions.
//!
//! Heartbeats are write-only and cannot prove the read side is alive,
//! so liveness is judged from the data itself: if no tick has arrived
//! within the staleness window on an open connection, the stream is
//! stale (a half-open socket looks exactly like this).

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Edge-triggered health events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    /// Ticks stopped flowing (emitted once per contiguous stale interval).
    Stale,
    /// Ticks resumed after a stale interval (emitted once per recovery).
    TickResumed,
}

/// Health monitor configuration.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// No tick for this long means the stream is stale.
    pub staleness_ms: i64,
    /// How often the periodic check runs.
    pub check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 60_000,
            check_interval_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct HealthState {
    last_tick_ms: RwLock<Option<i64>>,
    is_stale: RwLock<bool>,
}

/// Tick-staleness monitor.
///
/// `record_tick` and `check_staleness` only touch locks and never
/// block; events go out an unbounded channel. Detection latency is at
/// most one check interval past the staleness threshold.
pub struct HealthMonitor {
    config: HealthConfig,
    state: Arc<HealthState>,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, event_tx: mpsc::UnboundedSender<HealthEvent>) -> Self {
        Self {
            config,
            state: Arc::new(HealthState {
                last_tick_ms: RwLock::new(None),
                is_stale: RwLock::new(false),
            }),
            event_tx,
            task: Mutex::new(None),
        }
    }

    /// (Re)arm the periodic staleness check. Idempotent: an already
    /// running task is stopped first.
    pub fn start(&self) {
        self.stop();

        let state = Arc::clone(&self.state);
        let tx = self.event_tx.clone();
        let staleness_ms = self.config.staleness_ms;
        let interval_ms = self.config.check_interval_ms;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            // The immediate first tick would check before any data flowed.
            interval.tick().await;
            loop {
                interval.tick().await;
                check(&state, staleness_ms, &tx);
            }
        });

        *self.task.lock() = Some(handle);
    }

    /// Cancel the periodic check and clear the stale flag.
    /// `last_tick_ms` is retained.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        *self.state.is_stale.write() = false;
    }

    /// Record a data tick and re-evaluate staleness inline.
    pub fn record_tick(&self) {
        *self.state.last_tick_ms.write() = Some(Utc::now().timestamp_millis());
        self.check_staleness();
    }

    /// Re-evaluate staleness; emits on edge transitions only.
    pub fn check_staleness(&self) {
        check(&self.state, self.config.staleness_ms, &self.event_tx);
    }

    /// Whether the stream is currently judged stale.
    pub fn is_stale(&self) -> bool {
        *self.state.is_stale.read()
    }

    /// Timestamp of the last recorded tick, if any.
    pub fn last_tick_ms(&self) -> Option<i64> {
        *self.state.last_tick_ms.read()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

fn check(state: &HealthState, staleness_ms: i64, tx: &mpsc::UnboundedSender<HealthEvent>) {
    let now = Utc::now().timestamp_millis();
    let stale = match *state.last_tick_ms.read() {
        Some(last) => now - last > staleness_ms,
        None => false,
    };

    let mut is_stale = state.is_stale.write();
    if stale == *is_stale {
        return;
    }
    *is_stale = stale;
    drop(is_stale);

    let event = if stale {
        HealthEvent::Stale
    } else {
        HealthEvent::TickResumed
    };
    debug!(?event, "Health transition");
    let _ = tx.send(event);
}

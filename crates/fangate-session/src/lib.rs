//! Shared upstream-session lifecycle pieces.
//!
//! Both provider sessions carry the same contract: a [`HealthMonitor`]
//! that detects a silent tick stream on an apparently-open connection,
//! and a [`ReconnectionManager`] that schedules capped exponential
//! backoff after disconnects.

pub mod health;
pub mod reconnect;

pub use health::{HealthConfig, HealthEvent, HealthMonitor};
pub use reconnect::{ReconnectConfig, ReconnectionManager};

//! Downstream websocket gateway.
//!
//! Accepts client connections, dispatches their requests to the
//! request coordinator, and fans upstream events out to per-symbol
//! subscriber sets with bounded per-client write queues.

pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod registry;
pub mod router;
pub mod server;
pub mod upstream;
pub mod wire;

pub use coordinator::{CoordinatorConfig, CoordinatorEvent, RequestCoordinator};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayConfig};
pub use hub::ClientHub;
pub use registry::{ClientId, SubscriptionRegistry};
pub use router::DataRouter;
pub use server::run_server;
pub use upstream::{FetchError, Upstream};
pub use wire::{ClientMessage, GatewayStatus, ReinitSource, ServerMessage};

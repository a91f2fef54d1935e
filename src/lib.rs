//! Pulsebus - change-notification bridge for live dashboards
//!
//! Consumes a broker topic of change events and pushes a `refresh` frame to
//! every authenticated WebSocket subscriber, so dashboards re-read their data
//! instead of polling.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod server;

pub use auth::{AccessGate, CapabilitySet, Claims, TokenCodec};
pub use bridge::{BridgeState, StreamBridgeConsumer};
pub use config::PulsebusConfig;
pub use server::{Notifier, SubscriberRegistry};

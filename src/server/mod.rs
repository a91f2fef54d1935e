//! Notification server
//!
//! Tracks live subscribers, fans refresh events out to them, and exposes the
//! HTTP/WebSocket endpoints.

pub mod http;
mod messages;
mod notifier;
mod registry;

pub use http::{create_router, run_http_server, serve, AppState, DEFAULT_SUBSCRIBER_BUFFER};
pub use messages::{ManualTriggerRequest, RefreshEvent, TriggerAck};
pub use notifier::{BridgeTask, Notifier};
pub use registry::{OutboundMessage, RegistrySendError, SubscriberHandle, SubscriberRegistry};

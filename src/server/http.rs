//! HTTP and WebSocket surface
//!
//! `/ws` admits a subscriber after the capability check and then only
//! pushes refresh frames; anything the client sends besides a close is
//! ignored. `/refresh` is the manual trigger for collaborating services.

use crate::auth::{
    AccessGate, CapabilityGuard, CapabilitySet, Claims, GateError, TokenSources, UpgradeTokenSources,
};
use crate::server::messages::{ManualTriggerRequest, TriggerAck};
use crate::server::notifier::Notifier;
use crate::server::registry::{OutboundMessage, SubscriberHandle, SubscriberRegistry};

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        FromRef, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Default outbound queue depth per subscriber
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AccessGate>,
    pub notifier: Notifier,
    pub ws_guard: CapabilityGuard,
    pub identity_guard: CapabilityGuard,
    pub subscriber_buffer: usize,
}

impl AppState {
    /// `ws_capabilities` is what a token needs to open `/ws`
    pub fn new(
        gate: Arc<AccessGate>,
        registry: Arc<SubscriberRegistry>,
        ws_capabilities: CapabilitySet,
    ) -> Self {
        Self {
            ws_guard: gate.require(ws_capabilities),
            identity_guard: gate.require(CapabilitySet::new()),
            notifier: Notifier::new(registry),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            gate,
        }
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.notifier.registry()
    }
}

impl FromRef<AppState> for Arc<AccessGate> {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

/// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/refresh", post(refresh_handler))
        .route("/api/me", get(me_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn me_handler(
    State(state): State<AppState>,
    sources: TokenSources,
) -> Result<Json<Claims>, GateError> {
    state.identity_guard.check(&sources).map(Json)
}

async fn refresh_handler(State(state): State<AppState>, body: Bytes) -> Json<TriggerAck> {
    let request = if body.is_empty() {
        ManualTriggerRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|e| {
            debug!(error = %e, "Ignoring unreadable refresh body");
            ManualTriggerRequest::default()
        })
    };

    let delivered = state.notifier.manual_trigger();
    info!(
        event = ?request.event,
        case_id = ?request.case_id,
        delivered,
        "Manual refresh triggered"
    );

    Json(TriggerAck::ok(delivered))
}

async fn ws_handler(
    State(state): State<AppState>,
    UpgradeTokenSources(sources): UpgradeTokenSources,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Admission is decided before looking at the upgrade itself
    let claims = match state.ws_guard.check(&sources) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, claims))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut rx) = SubscriberHandle::channel(Some(claims.subject_id), state.subscriber_buffer);
    let conn_id = handle.id();
    let registry = state.registry().clone();
    registry.connect(handle);

    info!(conn_id = %conn_id, subject_id = claims.subject_id, "WebSocket subscriber admitted");

    // Ends when the registry drops the handle or the socket stops accepting frames
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(frame(&msg)).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg_result) = receiver.next().await {
            match msg_result {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.disconnect(conn_id);
    debug!(conn_id = %conn_id, "WebSocket subscriber closed");
}

fn frame(msg: &OutboundMessage) -> Message {
    Message::Text(msg.payload.to_string().into())
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Run the HTTP server
pub async fn run_http_server<F>(bind_addr: SocketAddr, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");
    serve(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Algorithm, SigningKey, TokenCodec, DEFAULT_COOKIE_NAME};

    fn state(ws_caps: &str) -> AppState {
        let codec = TokenCodec::new(SigningKey::new(b"http-unit".to_vec()), Algorithm::HS256);
        let gate = Arc::new(AccessGate::new(codec, DEFAULT_COOKIE_NAME));
        AppState::new(gate, Arc::new(SubscriberRegistry::new()), CapabilitySet::parse_list(ws_caps))
    }

    #[test]
    fn test_identity_guard_requires_nothing() {
        let state = state("view_dashboard");
        assert!(state.identity_guard.required().is_empty());
        assert!(state.ws_guard.required().contains("view_dashboard"));
    }

    #[test]
    fn test_subscriber_buffer_floor() {
        let state = state("").with_subscriber_buffer(0);
        assert_eq!(state.subscriber_buffer, 1);
    }

    #[test]
    fn test_frame_is_text() {
        let msg = OutboundMessage {
            payload: Arc::from(r#"{"event":"refresh"}"#),
        };
        match frame(&msg) {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"event":"refresh"}"#),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

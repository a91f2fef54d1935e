//! Broker → callback bridge
//!
//! Consumes a change stream and turns every message into a trigger. The
//! consumer never gives up: connect and consume errors are logged, followed
//! by a fixed backoff and a fresh connect.
//!
//! ```text
//! Disconnected → Connecting → Consuming ─(error)→ Backoff → Connecting → …
//!                     └────────(error)────────────┘
//! any state ─(stop)→ Stopped
//! ```

#[cfg(feature = "kafka")]
mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};

use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default delay between reconnect attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Default cap on a blocking broker handshake; a stop request can wait this long
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("broker connect failed: {0}")]
    ConnectFailed(String),

    #[error("broker consume failed: {0}")]
    ConsumeFailed(String),

    #[error("connect abandoned on shutdown")]
    Cancelled,
}

/// A source of change streams
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a subscription to the configured topic
    ///
    /// Once `cancel` fires the attempt should end quickly. Whatever it opened
    /// must be released before it returns; the bridge waits for it.
    async fn connect(&self, cancel: &CancellationToken)
        -> Result<Box<dyn TriggerStream>, StreamError>;
}

/// An open subscription
#[async_trait]
pub trait TriggerStream: Send {
    /// Wait for the next message. `None` means the broker ended the stream.
    async fn next_trigger(&mut self) -> Option<Result<(), StreamError>>;

    /// Release the broker connection
    async fn close(self: Box<Self>);
}

/// Waits out the backoff delay
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Backoff on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Lifecycle state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Consuming,
    Backoff,
    Stopped,
}

/// How a consuming session ended
enum SessionEnd {
    Cancelled,
    Failed(StreamError),
}

/// Reconnecting stream consumer
pub struct StreamBridgeConsumer {
    broker: Arc<dyn Broker>,
    sleeper: Arc<dyn Sleeper>,
    backoff: Duration,
    cancel: CancellationToken,
    state: watch::Sender<BridgeState>,
}

impl StreamBridgeConsumer {
    pub fn new(broker: Arc<dyn Broker>, backoff: Duration) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            broker,
            sleeper: Arc::new(TokioSleeper),
            backoff,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Replace the backoff timer
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Receiver for state transitions
    pub fn state_receiver(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask [`run`](Self::run) to close its connection and return
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Consume until stopped, calling `on_trigger` once per message
    ///
    /// Never returns an error; only cancellation ends the loop.
    pub async fn run<F>(&self, on_trigger: F)
    where
        F: Fn() + Send + Sync,
    {
        info!(backoff = ?self.backoff, "Stream bridge starting");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(BridgeState::Connecting);

            let connected = self.broker.connect(&self.cancel).await;
            if self.cancel.is_cancelled() {
                if let Ok(stream) = connected {
                    stream.close().await;
                }
                break;
            }

            match connected {
                Ok(stream) => {
                    self.set_state(BridgeState::Consuming);
                    info!("Stream bridge consuming");

                    match self.consume(stream, &on_trigger).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, "Stream consume failed, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.backoff, "Stream connect failed");
                }
            }

            self.set_state(BridgeState::Backoff);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.sleeper.sleep(self.backoff) => {}
            }
        }

        self.set_state(BridgeState::Stopped);
        info!("Stream bridge stopped");
    }

    async fn consume<F>(&self, mut stream: Box<dyn TriggerStream>, on_trigger: &F) -> SessionEnd
    where
        F: Fn() + Send + Sync,
    {
        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                next = stream.next_trigger() => match next {
                    Some(Ok(())) => fire(on_trigger),
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => {
                        break SessionEnd::Failed(StreamError::ConsumeFailed(
                            "stream ended".to_string(),
                        ))
                    }
                },
            }
        };

        stream.close().await;
        debug!("Broker stream closed");
        end
    }

    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }
}

fn fire<F: Fn()>(on_trigger: &F) {
    if catch_unwind(AssertUnwindSafe(on_trigger)).is_err() {
        error!("Trigger callback panicked");
    }
}

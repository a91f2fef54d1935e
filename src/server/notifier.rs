//! Trigger → broadcast wiring

use crate::bridge::StreamBridgeConsumer;
use crate::server::messages::RefreshEvent;
use crate::server::registry::SubscriberRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns triggers from either source into a refresh broadcast
#[derive(Debug, Clone)]
pub struct Notifier {
    registry: Arc<SubscriberRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Callback for the stream bridge
    pub fn on_trigger(&self) {
        let delivered = self.registry.broadcast(&RefreshEvent::refresh());
        debug!(delivered, source = "stream", "Refresh broadcast");
    }

    /// Trigger requested by a collaborating service
    pub fn manual_trigger(&self) -> usize {
        let delivered = self.registry.broadcast(&RefreshEvent::refresh());
        debug!(delivered, source = "manual", "Refresh broadcast");
        delivered
    }

    /// Start `consumer` in the background with this notifier as its callback
    pub fn spawn_bridge(&self, consumer: Arc<StreamBridgeConsumer>) -> BridgeTask {
        let cancel = consumer.cancel_token();
        let notifier = self.clone();
        let handle = tokio::spawn(async move {
            consumer.run(move || notifier.on_trigger()).await;
        });

        BridgeTask { handle, cancel }
    }
}

/// A running stream bridge
pub struct BridgeTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl BridgeTask {
    /// Cancel the bridge and wait up to `timeout` for it to close its connection
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();

        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("Stream bridge shut down"),
            Ok(Err(e)) => warn!(error = %e, "Stream bridge task failed"),
            Err(_) => {
                warn!(timeout = ?timeout, "Stream bridge did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeState, Broker, StreamError, TriggerStream};
    use crate::server::registry::SubscriberHandle;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct QueueStream {
        rx: mpsc::UnboundedReceiver<()>,
    }

    #[async_trait]
    impl TriggerStream for QueueStream {
        async fn next_trigger(&mut self) -> Option<Result<(), StreamError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(self: Box<Self>) {}
    }

    struct OneShotBroker {
        stream: Mutex<Option<QueueStream>>,
    }

    #[async_trait]
    impl Broker for OneShotBroker {
        async fn connect(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn TriggerStream>, StreamError> {
            match self.stream.lock().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(StreamError::ConnectFailed("gone".to_string())),
            }
        }
    }

    #[test]
    fn test_manual_trigger_counts_deliveries() {
        let registry = Arc::new(SubscriberRegistry::new());
        let notifier = Notifier::new(registry.clone());
        assert_eq!(notifier.manual_trigger(), 0);

        let (a, _rx_a) = SubscriberHandle::channel(Some(1), 4);
        let (b, _rx_b) = SubscriberHandle::channel(Some(2), 4);
        registry.connect(a);
        registry.connect(b);

        assert_eq!(notifier.manual_trigger(), 2);
    }

    #[test]
    fn test_both_paths_emit_same_frame() {
        let registry = Arc::new(SubscriberRegistry::new());
        let notifier = Notifier::new(registry.clone());
        let (handle, mut rx) = SubscriberHandle::channel(None, 4);
        registry.connect(handle);

        notifier.on_trigger();
        notifier.manual_trigger();

        let from_stream = rx.try_recv().unwrap();
        let from_manual = rx.try_recv().unwrap();
        assert_eq!(from_stream.payload, from_manual.payload);
    }

    #[tokio::test]
    async fn test_spawned_bridge_broadcasts_and_shuts_down() {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(OneShotBroker {
            stream: Mutex::new(Some(QueueStream { rx: trigger_rx })),
        });
        let consumer = Arc::new(StreamBridgeConsumer::new(broker, Duration::from_secs(5)));
        let mut state = consumer.state_receiver();

        let registry = Arc::new(SubscriberRegistry::new());
        let notifier = Notifier::new(registry.clone());
        let (handle, mut rx) = SubscriberHandle::channel(None, 4);
        registry.connect(handle);

        let task = notifier.spawn_bridge(consumer.clone());
        state.wait_for(|s| *s == BridgeState::Consuming).await.unwrap();

        trigger_tx.send(()).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg.payload, r#"{"event":"refresh"}"#);

        task.shutdown(Duration::from_secs(1)).await;
        assert_eq!(consumer.state(), BridgeState::Stopped);
    }
}

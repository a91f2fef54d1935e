//! Kafka broker backend
//!
//! Every record on the topic is a trigger; payloads are never read. Offsets
//! are auto-committed and new consumer groups start at the latest offset,
//! which gives the at-most-once delivery the bridge needs.

use crate::bridge::{Broker, StreamError, TriggerStream, DEFAULT_CONNECT_TIMEOUT};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection settings for the change topic
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    /// Kafka bootstrap servers (comma-separated)
    pub bootstrap_servers: String,
    /// Topic carrying change events
    pub topic: String,
    /// Consumer group id
    pub group_id: String,
    /// How long a connect attempt may wait for broker metadata
    pub connect_timeout: Duration,
}

impl KafkaBrokerConfig {
    pub fn new(
        bootstrap_servers: impl Into<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the metadata timeout used to detect an unreachable broker
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("enable.auto.commit", "true");
        config.set("auto.offset.reset", "latest");
        config
    }
}

/// Opens a fresh `StreamConsumer` per connect attempt
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn TriggerStream>, StreamError> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| StreamError::ConnectFailed(format!("failed to create consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        // Consumer creation is lazy; a metadata round trip proves the broker is reachable
        let client = consumer.clone();
        let topic = self.config.topic.clone();
        let timeout = self.config.connect_timeout;
        let mut metadata =
            tokio::task::spawn_blocking(move || client.fetch_metadata(Some(topic.as_str()), timeout));

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // fetch_metadata cannot be interrupted; the client is only freed once it returns
                let _ = (&mut metadata).await;
                return Err(StreamError::Cancelled);
            }
            result = &mut metadata => result,
        };
        fetched
            .map_err(|e| StreamError::ConnectFailed(format!("metadata request aborted: {}", e)))?
            .map_err(|e| StreamError::ConnectFailed(format!("broker unreachable: {}", e)))?;

        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| StreamError::ConnectFailed(format!("failed to subscribe: {}", e)))?;

        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Subscribed to Kafka topic"
        );

        Ok(Box::new(KafkaTriggerStream { consumer }))
    }
}

struct KafkaTriggerStream {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl TriggerStream for KafkaTriggerStream {
    async fn next_trigger(&mut self) -> Option<Result<(), StreamError>> {
        match self.consumer.recv().await {
            Ok(message) => {
                debug!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Received change event"
                );
                Some(Ok(()))
            }
            Err(e) => Some(Err(StreamError::ConsumeFailed(e.to_string()))),
        }
    }

    async fn close(self: Box<Self>) {
        self.consumer.unsubscribe();
        debug!("Kafka consumer unsubscribed");
    }
}

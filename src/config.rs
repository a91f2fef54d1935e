//! Runtime configuration
//!
//! Built once at startup (the binaries fill it from flags and environment)
//! and handed to every component that needs a setting.

use crate::auth::{AccessGate, Algorithm, CapabilitySet, SigningKey, TokenCodec, DEFAULT_COOKIE_NAME};
use crate::bridge::{DEFAULT_BACKOFF, DEFAULT_CONNECT_TIMEOUT};
use crate::server::{AppState, SubscriberRegistry, DEFAULT_SUBSCRIBER_BUFFER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
pub const DEFAULT_TOPIC: &str = "lost_persons_updates";
pub const DEFAULT_GROUP_ID: &str = "pulsebus-dashboard";
pub const DEFAULT_TOKEN_TTL_MINUTES: u64 = 60;
/// One year
pub const MAX_TOKEN_TTL_MINUTES: u64 = 366 * 24 * 60;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("secret key must not be empty")]
    EmptySecret,

    #[error("unsupported signing algorithm: {0}")]
    Algorithm(String),

    #[error("token lifetime must be at least one minute")]
    ZeroTokenTtl,

    #[error("token lifetime must not exceed one year")]
    TokenTtlTooLarge,

    #[error("reconnect backoff must be positive")]
    ZeroBackoff,
}

/// Settings for the daemon and the operator CLI
#[derive(Debug, Clone)]
pub struct PulsebusConfig {
    pub bind_addr: SocketAddr,
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    pub secret_key: String,
    pub algorithm: String,
    pub cookie_name: String,
    pub token_ttl_minutes: u64,
    pub backoff: Duration,
    /// Capabilities a token needs to open the realtime channel
    pub ws_capabilities: CapabilitySet,
    pub subscriber_buffer: usize,
    pub shutdown_timeout: Duration,
}

impl PulsebusConfig {
    /// Defaults for everything except the secret
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            secret_key: secret_key.into(),
            algorithm: Algorithm::HS256.to_string(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            token_ttl_minutes: DEFAULT_TOKEN_TTL_MINUTES,
            backoff: DEFAULT_BACKOFF,
            ws_capabilities: CapabilitySet::new(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        self.signing_algorithm()?;
        if self.token_ttl_minutes == 0 {
            return Err(ConfigError::ZeroTokenTtl);
        }
        if self.token_ttl_minutes > MAX_TOKEN_TTL_MINUTES {
            return Err(ConfigError::TokenTtlTooLarge);
        }
        if self.backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff);
        }
        Ok(())
    }

    pub fn signing_algorithm(&self) -> Result<Algorithm, ConfigError> {
        self.algorithm
            .parse()
            .map_err(|_| ConfigError::Algorithm(self.algorithm.clone()))
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_minutes.saturating_mul(60))
    }

    pub fn token_codec(&self) -> Result<TokenCodec, ConfigError> {
        self.validate()?;
        Ok(TokenCodec::new(
            SigningKey::new(self.secret_key.as_bytes().to_vec()),
            self.signing_algorithm()?,
        ))
    }

    pub fn access_gate(&self) -> Result<Arc<AccessGate>, ConfigError> {
        Ok(Arc::new(AccessGate::new(self.token_codec()?, self.cookie_name.clone())))
    }

    /// Handler state over a shared registry
    pub fn app_state(&self, registry: Arc<SubscriberRegistry>) -> Result<AppState, ConfigError> {
        Ok(AppState::new(self.access_gate()?, registry, self.ws_capabilities.clone())
            .with_subscriber_buffer(self.subscriber_buffer))
    }

    /// Broker settings; a connect attempt gets at most half the shutdown budget
    #[cfg(feature = "kafka")]
    pub fn broker_config(&self) -> crate::bridge::KafkaBrokerConfig {
        crate::bridge::KafkaBrokerConfig::new(&self.bootstrap_servers, &self.topic, &self.group_id)
            .with_connect_timeout(self.connect_timeout())
    }

    /// Longest a broker connect attempt may block a stop request
    pub fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT.min(self.shutdown_timeout / 2)
    }
}

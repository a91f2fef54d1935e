//! Pulsebus daemon - change stream to WebSocket refresh bridge

use anyhow::{Context, Result};
use clap::Parser;
use pulsebus::auth::CapabilitySet;
use pulsebus::config::{PulsebusConfig, DEFAULT_BIND, DEFAULT_BOOTSTRAP_SERVERS, DEFAULT_GROUP_ID, DEFAULT_TOPIC};
use pulsebus::server::{run_http_server, BridgeTask, Notifier, SubscriberRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pulsebusd")]
#[command(about = "Pulsebus change-notification daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = DEFAULT_BIND, env = "PULSEBUS_BIND")]
    bind: String,

    /// Kafka bootstrap servers
    #[arg(long, default_value = DEFAULT_BOOTSTRAP_SERVERS, env = "KAFKA_BOOTSTRAP_SERVERS")]
    bootstrap_servers: String,

    /// Topic carrying change events
    #[arg(long, default_value = DEFAULT_TOPIC, env = "PULSEBUS_TOPIC")]
    topic: String,

    /// Kafka consumer group
    #[arg(long, default_value = DEFAULT_GROUP_ID, env = "PULSEBUS_GROUP_ID")]
    group_id: String,

    /// Token signing secret shared with the auth service
    #[arg(long, env = "AUTH_SECRET_KEY", hide_env_values = true)]
    secret: String,

    /// Token signing algorithm
    #[arg(long, default_value = "HS256", env = "AUTH_ALGORITHM")]
    algorithm: String,

    /// Session cookie carrying the token
    #[arg(long, default_value = "lpm_token", env = "PULSEBUS_COOKIE_NAME")]
    cookie_name: String,

    /// Access token lifetime in minutes
    #[arg(long, default_value_t = 60, env = "AUTH_ACCESS_TOKEN_EXPIRE_MINUTES")]
    token_ttl_minutes: u64,

    /// Seconds to wait before reconnecting to the broker
    #[arg(long, default_value_t = 5, env = "PULSEBUS_BACKOFF_SECS")]
    backoff_secs: u64,

    /// Capabilities required to open /ws (comma-separated)
    #[arg(long, default_value = "", env = "PULSEBUS_WS_PERMISSIONS")]
    ws_permissions: String,

    /// Outbound queue depth per subscriber
    #[arg(long, default_value_t = 32, env = "PULSEBUS_SUBSCRIBER_BUFFER")]
    subscriber_buffer: usize,

    /// Seconds to wait for the stream bridge on shutdown
    #[arg(long, default_value_t = 5, env = "PULSEBUS_SHUTDOWN_TIMEOUT_SECS")]
    shutdown_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<PulsebusConfig> {
        let mut config = PulsebusConfig::new(self.secret);
        config.bind_addr = self.bind.parse().context("Invalid bind address")?;
        config.bootstrap_servers = self.bootstrap_servers;
        config.topic = self.topic;
        config.group_id = self.group_id;
        config.algorithm = self.algorithm;
        config.cookie_name = self.cookie_name;
        config.token_ttl_minutes = self.token_ttl_minutes;
        config.backoff = Duration::from_secs(self.backoff_secs);
        config.ws_capabilities = CapabilitySet::parse_list(&self.ws_permissions);
        config.subscriber_buffer = self.subscriber_buffer;
        config.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    run_server(config).await
}

async fn run_server(config: PulsebusConfig) -> Result<()> {
    let registry = Arc::new(SubscriberRegistry::new());
    let state = config
        .app_state(registry.clone())
        .context("Invalid token settings")?;

    let bridge = start_bridge(&config, &state.notifier);

    info!(
        addr = %config.bind_addr,
        topic = %config.topic,
        ws_permissions = %config.ws_capabilities,
        "Pulsebus daemon starting"
    );

    let served = run_http_server(config.bind_addr, state, shutdown_signal()).await;
    info!(subscribers = registry.count(), "HTTP server stopped");

    if let Some(bridge) = bridge {
        bridge.shutdown(config.shutdown_timeout).await;
    }

    served?;
    info!("Pulsebus daemon stopped");
    Ok(())
}

#[cfg(feature = "kafka")]
fn start_bridge(config: &PulsebusConfig, notifier: &Notifier) -> Option<BridgeTask> {
    use pulsebus::bridge::{KafkaBroker, StreamBridgeConsumer};

    let broker = Arc::new(KafkaBroker::new(config.broker_config()));
    let consumer = Arc::new(StreamBridgeConsumer::new(broker, config.backoff));
    Some(notifier.spawn_bridge(consumer))
}

#[cfg(not(feature = "kafka"))]
fn start_bridge(config: &PulsebusConfig, _notifier: &Notifier) -> Option<BridgeTask> {
    warn!(
        topic = %config.topic,
        "Built without the `kafka` feature; only POST /refresh will trigger refreshes"
    );
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping server");
}

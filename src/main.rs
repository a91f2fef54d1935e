//! Pulsebus CLI entry point

mod cli;

use crate::cli::{Cli, Commands, TokenCommands};
use anyhow::{Context, Result};
use clap::Parser;
use pulsebus::auth::{AuthError, CapabilitySet, Claims, TokenCodec};
use pulsebus::config::PulsebusConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Token { command } => {
            let secret = cli
                .secret
                .context("AUTH_SECRET_KEY or --secret required to sign tokens")?;
            let mut config = PulsebusConfig::new(secret);
            config.algorithm = cli.algorithm;

            match command {
                TokenCommands::Issue {
                    sub,
                    username,
                    permission,
                    ttl_minutes,
                } => {
                    config.token_ttl_minutes = ttl_minutes;
                    issue(&config, sub, username, permission)
                }
                TokenCommands::Inspect { token } => inspect(&config, &token),
            }
        }
    }
}

fn issue(config: &PulsebusConfig, sub: i64, username: String, permissions: Vec<String>) -> Result<()> {
    let codec = config.token_codec().context("Invalid token settings")?;
    let claims = Claims::new(sub, username, permissions.into_iter().collect::<CapabilitySet>());
    let token = codec
        .encode(&claims, config.token_ttl())
        .context("Failed to sign token")?;

    println!("{}", token);
    println!();
    println!("Subject: {} ({})", claims.username, claims.subject_id);
    println!("Algorithm: {}", codec.algorithm());
    println!("Expires in: {} minutes", config.token_ttl_minutes);
    println!("Permissions:");
    print_capabilities(&claims.capabilities);

    Ok(())
}

fn inspect(config: &PulsebusConfig, token: &str) -> Result<()> {
    let codec = config.token_codec().context("Invalid token settings")?;

    match codec.decode_token(token) {
        Ok(decoded) => {
            println!("Valid token");
            println!("Subject: {} ({})", decoded.claims.username, decoded.claims.subject_id);
            if let Some(iat) = decoded.issued_at {
                println!("Issued at: {}", iat);
            }
            println!("Expires at: {}", decoded.expires_at);
            println!("Permissions:");
            print_capabilities(&decoded.claims.capabilities);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Token rejected: {}", describe(&codec, e))),
    }
}

fn describe(codec: &TokenCodec, error: AuthError) -> String {
    match error {
        AuthError::SignatureInvalid => format!("{} (expected {} with the configured key)", error, codec.algorithm()),
        AuthError::Malformed | AuthError::Expired => error.to_string(),
    }
}

fn print_capabilities(capabilities: &CapabilitySet) {
    if capabilities.is_empty() {
        println!("  (none)");
    } else {
        for capability in capabilities.iter() {
            println!("  {}", capability);
        }
    }
}

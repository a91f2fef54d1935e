//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pulsebus")]
#[command(about = "Operator tools for the pulsebus notification bridge", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Token signing secret shared with the auth service
    #[arg(long, env = "AUTH_SECRET_KEY", global = true, hide_env_values = true)]
    pub secret: Option<String>,

    /// Signing algorithm (HS256, HS384 or HS512)
    #[arg(long, env = "AUTH_ALGORITHM", global = true, default_value = "HS256")]
    pub algorithm: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Issue and inspect access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Mint a token
    ///
    /// Examples:
    ///   pulsebus token issue --sub 7 --username ops -p view_dashboard
    ///   pulsebus token issue --sub 7 --username ops -p view_dashboard -p manage_cases --ttl-minutes 5
    Issue {
        /// Numeric subject id
        #[arg(long)]
        sub: i64,

        /// Username carried in the token
        #[arg(long)]
        username: String,

        /// Capability to grant (can be repeated)
        #[arg(short, long = "permission", value_parser = parse_capability)]
        permission: Vec<String>,

        /// Token lifetime in minutes
        #[arg(long, env = "AUTH_ACCESS_TOKEN_EXPIRE_MINUTES", default_value_t = 60)]
        ttl_minutes: u64,
    },

    /// Verify a token and show its claims
    Inspect {
        /// Token to check
        token: String,
    },
}

fn parse_capability(s: &str) -> Result<String, String> {
    let s = s.trim();
    if s.is_empty() || s.contains(',') {
        return Err(format!("Invalid capability: {:?}", s));
    }
    Ok(s.to_string())
}

//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth 2.0 bridge authorization server tooling
#[derive(Parser, Debug)]
#[command(name = "oauth-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OAUTH_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "OAUTH_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OAUTH_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate the configuration, then print a redacted summary
    Check,

    /// Print a fresh random signing secret
    Keygen,

    /// Verify a signed token and print its claims
    Inspect {
        /// Signed access or refresh token
        #[arg(required = true)]
        token: String,
    },

    /// List clients in the configured registry file
    Clients {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Print the upstream authorization URL users are sent to
    AuthorizeUrl {
        /// Correlation state to embed (random when omitted)
        #[arg(long)]
        state: Option<String>,
    },
}

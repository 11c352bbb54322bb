//! OAuth Bridge Library
//!
//! OAuth 2.0 authorization server that authenticates users against an
//! upstream identity provider and issues its own signed, stateless tokens.
//!
//! # Components
//!
//! - **Token codec**: HS256 signed tokens carrying client, scopes and the wrapped upstream token
//! - **Client registry**: pluggable storage for dynamically registered clients
//! - **Correlation cache**: pluggable short-lived store linking the redirect legs of a flow
//! - **Upstream adapter**: authorization URL, code exchange and refresh against the upstream provider
//! - **Bridge provider**: the downstream-facing authorization-code state machine
//!
//! HTTP routing is left to the embedding server; [`oauth::BridgeProvider`]
//! exposes the operations its `register`, `authorize`, `token` and callback
//! routes need.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod registry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
    }

    Ok(())
}

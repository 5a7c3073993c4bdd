//! MCP OAuth Bridge Library
//!
//! Lets a local JSON-RPC client speaking newline-delimited JSON over stdio
//! call a remote resource server that requires an OAuth2 bearer credential.
//!
//! # Features
//!
//! - **Credential lifecycle**: authorization-code exchange, refresh with
//!   rotated single-use refresh tokens, atomic on-disk persistence
//! - **Single-flight refresh**: concurrent callers share one refresh
//! - **Retry once on rejection**: a 401/403 triggers one refresh and one retry
//! - **Concurrent stdio bridge**: partial-line buffering, per-message tasks,
//!   drain on end of input
//!
//! All logging goes to stderr; stdout carries protocol bytes only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod protocol;
pub mod resource;
pub mod retry;
pub mod router;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging on stderr
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}

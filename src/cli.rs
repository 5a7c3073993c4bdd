//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Stdio JSON-RPC bridge to an OAuth2-protected resource server
#[derive(Parser, Debug)]
#[command(name = "mcp-oauth-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OAUTH_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OAUTH_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OAUTH_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to serve)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bridge stdin/stdout to the resource server (default)
    Serve,

    /// Exchange an authorization code and store the credential
    Authorize {
        /// Authorization code from the provider's redirect
        #[arg(long)]
        code: String,

        /// Redirect URI the code was issued for (default: oauth.redirect_uri)
        #[arg(long)]
        redirect_uri: Option<String>,
    },

    /// Force a refresh of the stored credential
    Refresh,

    /// Print the credential status as JSON
    Status,

    /// Print the provider's authorization URL
    AuthUrl {
        /// Opaque state value echoed back by the provider
        #[arg(long)]
        state: Option<String>,
    },
}

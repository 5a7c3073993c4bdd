//! mcp-oauth-bridge - stdio JSON-RPC bridge to an OAuth2-protected resource server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use mcp_oauth_bridge::{
    agent::Agent,
    cli::{Cli, Command},
    config::Config,
    oauth::AuthorizationGrant,
    setup_tracing,
};

/// Exit status after a termination signal (128 + SIGINT)
const SIGNAL_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Needs only the config, not a working agent
    if let Some(Command::AuthUrl { state }) = &cli.command {
        return run_auth_url(&config, state.as_deref());
    }

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Authorize { code, redirect_uri }) => run_authorize(&agent, code, redirect_uri).await,
        Some(Command::Refresh) => run_refresh(&agent).await,
        Some(Command::Status) => print_status(&agent),
        Some(Command::AuthUrl { .. }) => ExitCode::SUCCESS,
        Some(Command::Serve) | None => run_server(&agent).await,
    }
}

/// Bridge stdin/stdout until end of input or a termination signal
async fn run_server(agent: &Agent) -> ExitCode {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting mcp-oauth-bridge");

    tokio::select! {
        result = agent.run_stdio() => match result {
            Ok(()) => {
                info!("Bridge shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Bridge error: {e}");
                ExitCode::FAILURE
            }
        },
        () = shutdown_signal() => {
            warn!(
                pending = agent.pending().len(),
                "Termination signal received, exiting without draining"
            );
            // A blocking stdin read would keep the runtime from shutting down
            std::process::exit(SIGNAL_EXIT_CODE);
        }
    }
}

async fn run_authorize(agent: &Agent, code: String, redirect_uri: Option<String>) -> ExitCode {
    let grant = AuthorizationGrant {
        code,
        redirect_uri: redirect_uri.unwrap_or_else(|| agent.config().oauth.redirect_uri.clone()),
    };

    match agent.tokens().exchange_authorization_code(&grant).await {
        Ok(credential) => {
            info!(expires_at = %credential.expires_at, "Credential stored");
            print_status(agent)
        }
        Err(e) => {
            error!("Authorization code exchange failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_refresh(agent: &Agent) -> ExitCode {
    match agent.tokens().refresh().await {
        Ok(credential) => {
            info!(expires_at = %credential.expires_at, "Credential refreshed");
            print_status(agent)
        }
        Err(e) => {
            error!("Refresh failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_status(agent: &Agent) -> ExitCode {
    match serde_json::to_string_pretty(&agent.tokens().status()) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize status: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_auth_url(config: &Config, state: Option<&str>) -> ExitCode {
    match config.oauth.authorization_url(state) {
        Ok(url) => {
            println!("{url}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

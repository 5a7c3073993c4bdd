//! The bridge process context
//!
//! Built once by the entry point; owns the token manager, resource client,
//! router and pending registry.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::Result;
use crate::config::Config;
use crate::oauth::{OAuthTokenManager, TokenStore};
use crate::resource::ResourceClient;
use crate::router::RequestRouter;
use crate::transport::{LineBridge, PendingRequests};

/// OAuth bridge agent
pub struct Agent {
    config: Config,
    tokens: Arc<OAuthTokenManager>,
    resource: Arc<ResourceClient>,
    router: Arc<RequestRouter>,
    pending: Arc<PendingRequests>,
}

impl Agent {
    /// Validate `config` and build every component
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete or invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = TokenStore::new(config.storage.token_path()?);
        let tokens = OAuthTokenManager::from_config(&config.oauth, store)?;
        let resource = Arc::new(ResourceClient::from_config(
            &config.resource,
            Arc::clone(&tokens),
        )?);
        let router = Arc::new(RequestRouter::new(
            Arc::clone(&tokens),
            Arc::clone(&resource),
            &config.router.forward,
            config.oauth.redirect_uri.clone(),
        )?);

        Ok(Self {
            config,
            tokens,
            resource,
            router,
            pending: Arc::new(PendingRequests::new()),
        })
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token manager
    #[must_use]
    pub fn tokens(&self) -> &Arc<OAuthTokenManager> {
        &self.tokens
    }

    /// Resource server client
    #[must_use]
    pub fn resource(&self) -> &Arc<ResourceClient> {
        &self.resource
    }

    /// Request router
    #[must_use]
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Messages read but not yet answered
    #[must_use]
    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Bridge `reader`/`writer` until end of input and drain
    ///
    /// # Errors
    ///
    /// Returns an error if reading the input fails.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let bridge = LineBridge::new(
            Arc::clone(&self.router),
            Arc::clone(&self.pending),
            self.config.bridge.max_line_bytes,
        );
        bridge.run(reader, writer).await
    }

    /// Bridge the process's stdin/stdout
    ///
    /// # Errors
    ///
    /// Returns an error if reading stdin fails.
    pub async fn run_stdio(&self) -> Result<()> {
        let status = self.tokens.status();
        info!(
            resource = %self.resource.url(),
            authorized = status.authorized,
            expires_at = ?status.expires_at,
            "Starting stdio bridge"
        );
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

//! OAuth token manager
//!
//! Owns the current credential and the only code paths that replace it.
//! Refreshes are single-flight: the refresh token is single-use, so two
//! concurrent refresh requests carrying the same token would make the
//! provider revoke one of them (`invalid_grant`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::credential::{AuthorizationGrant, Credential};
use super::endpoint::{ClientAuthMethod, TokenEndpoint, TokenGrant};
use super::storage::TokenStore;
use crate::config::OAuthConfig;
use crate::error::{AuthError, AuthErrorKind};
use crate::retry::{RetryPolicy, with_retry};
use crate::Error;

/// Shared handle to the one live refresh
type RefreshOperation = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

/// Mutable credential state
#[derive(Default)]
struct TokenState {
    /// Current credential
    current: Option<Credential>,
    /// Bumped on every replacement of `current`
    generation: u64,
    /// Why refreshing is blocked until the authorization-code flow runs again
    reauthorization: Option<String>,
}

/// Non-secret snapshot of the credential state
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    /// A credential is loaded
    pub authorized: bool,
    /// Token type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Access token expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry (0 once expired)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    /// Access token is within the refresh margin or expired
    pub needs_refresh: bool,
    /// Granted scopes
    pub scope: Vec<String>,
    /// A refresh token is held
    pub has_refresh_token: bool,
    /// Operator must re-run the authorization-code flow
    pub reauthorization_required: bool,
    /// Why re-authorization is required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reauthorization_reason: Option<String>,
    /// Client authentication encoding the provider accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_auth_method: Option<ClientAuthMethod>,
    /// Successful refreshes in this process
    pub refreshes: u64,
}

/// Produces valid credentials on demand
pub struct OAuthTokenManager {
    endpoint: TokenEndpoint,
    store: TokenStore,
    state: RwLock<TokenState>,
    in_flight: Mutex<Option<RefreshOperation>>,
    /// Orders credential file writes
    persist_lock: tokio::sync::Mutex<()>,
    refresh_margin: Duration,
    retry: RetryPolicy,
    refreshes: AtomicU64,
}

/// Clears the in-flight slot when the refresh task finishes, panics included
struct InFlightGuard<'a>(&'a Mutex<Option<RefreshOperation>>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

impl OAuthTokenManager {
    /// Create a manager, loading any stored credential
    #[must_use]
    pub fn new(
        endpoint: TokenEndpoint,
        store: TokenStore,
        refresh_margin: Duration,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let current = match store.load() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable credential file");
                None
            }
        };

        if current.is_none() {
            info!(
                path = %store.path().display(),
                "No credential yet; run the authorization-code exchange"
            );
        }

        Arc::new(Self {
            endpoint,
            store,
            state: RwLock::new(TokenState {
                current,
                ..TokenState::default()
            }),
            in_flight: Mutex::new(None),
            persist_lock: tokio::sync::Mutex::new(()),
            refresh_margin,
            retry,
            refreshes: AtomicU64::new(0),
        })
    }

    /// Create from config, loading the credential from `store`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &OAuthConfig, store: TokenStore) -> crate::Result<Arc<Self>> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let endpoint = TokenEndpoint::new(
            http_client,
            config.token_url.clone(),
            config.resolve_client_id(),
            config.resolve_client_secret(),
            config.auth_methods.clone(),
        );

        Ok(Self::new(
            endpoint,
            store,
            config.refresh_margin,
            RetryPolicy::new(&config.retry),
        ))
    }

    /// Exchange a one-time authorization code for a credential.
    ///
    /// Replaces any current credential and clears a pending
    /// re-authorization requirement. Stored state is untouched on failure.
    pub async fn exchange_authorization_code(
        &self,
        grant: &AuthorizationGrant,
    ) -> Result<Credential, AuthError> {
        // Codes are single-use: no retry
        let response = self
            .endpoint
            .request(TokenGrant::AuthorizationCode {
                code: &grant.code,
                redirect_uri: &grant.redirect_uri,
            })
            .await?;

        let credential = Credential::from_response(
            response.access_token,
            response.token_type,
            response.refresh_token,
            response.expires_in,
            response.scope.as_deref(),
        );

        self.install(credential.clone(), None, true).await;
        info!(scope = %credential.scope_string(), "Authorization code exchanged");
        Ok(credential)
    }

    /// Current credential if it is outside the refresh margin, otherwise the
    /// result of a (shared) refresh
    pub async fn get_valid_credential(self: &Arc<Self>) -> Result<Credential, AuthError> {
        let generation = {
            let state = self.state.read();
            match state.current {
                Some(ref credential) if !credential.needs_refresh(self.refresh_margin) => {
                    return Ok(credential.clone());
                }
                Some(_) => state.generation,
                None => return Err(not_authorized()),
            }
        };

        debug!("Credential expired or expiring, refreshing");
        self.refresh_from(Some(generation)).await
    }

    /// Force a refresh, joining one that is already running
    pub async fn refresh(self: &Arc<Self>) -> Result<Credential, AuthError> {
        self.refresh_from(None).await
    }

    /// Called after the resource server rejected `rejected`. Returns the
    /// current credential if it has already been replaced, otherwise forces
    /// a refresh.
    pub async fn refresh_after_rejection(
        self: &Arc<Self>,
        rejected: &Credential,
    ) -> Result<Credential, AuthError> {
        let generation = {
            let state = self.state.read();
            match state.current {
                Some(ref current) if current.access_token != rejected.access_token => {
                    debug!("Rejected credential already replaced");
                    return Ok(current.clone());
                }
                Some(_) => state.generation,
                None => return Err(not_authorized()),
            }
        };

        self.refresh_from(Some(generation)).await
    }

    /// Join the live refresh or start one.
    ///
    /// `seen_generation` is the credential generation the caller found
    /// stale; if it has been replaced by the time the refresh runs, the
    /// provider is not contacted.
    async fn refresh_from(
        self: &Arc<Self>,
        seen_generation: Option<u64>,
    ) -> Result<Credential, AuthError> {
        let operation = {
            let mut slot = self.in_flight.lock();
            if let Some(operation) = slot.as_ref() {
                debug!("Joining in-flight token refresh");
                operation.clone()
            } else {
                let operation = self.start_refresh(seen_generation);
                *slot = Some(operation.clone());
                operation
            }
        };

        operation.await
    }

    /// Spawn the refresh so that it completes (and clears the slot) even if
    /// every waiter goes away
    fn start_refresh(self: &Arc<Self>, seen_generation: Option<u64>) -> RefreshOperation {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _slot = InFlightGuard(&manager.in_flight);
            manager.perform_refresh(seen_generation).await
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(AuthError::provider(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    async fn perform_refresh(&self, seen_generation: Option<u64>) -> Result<Credential, AuthError> {
        let (previous, refresh_token, generation) = {
            let state = self.state.read();
            if let Some(ref reason) = state.reauthorization {
                return Err(AuthError::invalid_grant(format!(
                    "re-authorization required: {reason}"
                )));
            }
            let Some(ref current) = state.current else {
                return Err(not_authorized());
            };
            if seen_generation.is_some_and(|g| g != state.generation) {
                return Ok(current.clone());
            }
            let Some(ref refresh_token) = current.refresh_token else {
                return Err(AuthError::invalid_grant(
                    "credential has no refresh token; run the authorization-code exchange",
                ));
            };
            (current.clone(), refresh_token.clone(), state.generation)
        };

        let endpoint = &self.endpoint;
        let token = refresh_token.as_str();
        let result = with_retry(&self.retry, "token_refresh", move || {
            endpoint.request(TokenGrant::RefreshToken {
                refresh_token: token,
            })
        })
        .await;

        match result {
            Ok(response) => {
                let credential = Credential::from_response(
                    response.access_token,
                    response.token_type,
                    response.refresh_token,
                    response.expires_in,
                    response.scope.as_deref(),
                )
                .succeed(&previous);

                if !self.install(credential.clone(), Some(generation), false).await {
                    return self.superseded();
                }
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                info!(expires_at = %credential.expires_at, "Access token refreshed");
                Ok(credential)
            }
            Err(e) => {
                let reason = match e.kind {
                    AuthErrorKind::InvalidGrant => Some(format!("refresh token rejected: {}", e.message)),
                    // The provider may have rotated the token without us seeing the answer
                    AuthErrorKind::Network if !e.retryable => {
                        Some(format!("refresh outcome unknown: {}", e.message))
                    }
                    _ => None,
                };

                let current = match reason {
                    Some(reason) => self.require_reauthorization(reason, generation),
                    None => {
                        let current = self.state.read().generation == generation;
                        if current {
                            warn!(error = %e, "Token refresh failed; stored credential kept");
                        }
                        current
                    }
                };
                if !current {
                    return self.superseded();
                }
                Err(e)
            }
        }
    }

    /// Outcome of a refresh whose source credential was replaced while the
    /// provider call ran (an authorization-code exchange landed meanwhile)
    fn superseded(&self) -> Result<Credential, AuthError> {
        debug!("Credential replaced during refresh; discarding refresh outcome");
        self.state.read().current.clone().ok_or_else(not_authorized)
    }

    /// Swap in a new credential, then persist it.
    ///
    /// With `expected_generation`, nothing is installed if the credential has
    /// been replaced since that generation was read. Returns whether the
    /// credential was installed.
    async fn install(
        &self,
        credential: Credential,
        expected_generation: Option<u64>,
        clear_reauthorization: bool,
    ) -> bool {
        let generation = {
            let mut state = self.state.write();
            if expected_generation.is_some_and(|g| g != state.generation) {
                return false;
            }
            state.current = Some(credential.clone());
            state.generation += 1;
            if clear_reauthorization {
                state.reauthorization = None;
            }
            state.generation
        };

        self.persist(credential, generation).await;
        true
    }

    /// Write `credential` unless a newer generation has been installed, in
    /// which case that install writes its own
    async fn persist(&self, credential: Credential, generation: u64) {
        let _order = self.persist_lock.lock().await;
        let stale = self.state.read().generation != generation;
        if stale {
            debug!(generation, "Skipping write of replaced credential");
            return;
        }

        let store = self.store.clone();
        let path = store.path().display().to_string();
        // The in-memory credential stays authoritative if this fails
        match tokio::task::spawn_blocking(move || store.save(&credential)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, path = %path, "Failed to persist credential"),
            Err(e) => error!(error = %e, path = %path, "Credential write task failed"),
        }
    }

    /// Block refreshing until the next code exchange, unless the credential
    /// read at `generation` has already been replaced. Returns whether the
    /// block was set.
    fn require_reauthorization(&self, reason: String, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        error!(
            reason = %reason,
            "OAuth re-authorization required: run the authorization-code exchange again"
        );
        state.reauthorization = Some(reason);
        true
    }

    /// Why refreshing is blocked, if it is
    #[must_use]
    pub fn reauthorization_required(&self) -> Option<String> {
        self.state.read().reauthorization.clone()
    }

    /// Non-secret snapshot for status reporting
    #[must_use]
    pub fn status(&self) -> CredentialStatus {
        let state = self.state.read();
        let current = state.current.as_ref();

        CredentialStatus {
            authorized: current.is_some(),
            token_type: current.map(|c| c.token_type.clone()),
            expires_at: current.map(|c| c.expires_at),
            expires_in_secs: current
                .map(|c| c.time_until_expiry().map_or(0, |d| d.as_secs())),
            needs_refresh: current.is_none_or(|c| c.needs_refresh(self.refresh_margin)),
            scope: current
                .map(|c| c.scope.iter().cloned().collect())
                .unwrap_or_default(),
            has_refresh_token: current.is_some_and(|c| c.refresh_token.is_some()),
            reauthorization_required: state.reauthorization.is_some(),
            reauthorization_reason: state.reauthorization.clone(),
            client_auth_method: self.endpoint.preferred_method(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

fn not_authorized() -> AuthError {
    AuthError::invalid_grant("no credential stored; run the authorization-code exchange")
}

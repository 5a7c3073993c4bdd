//! OAuth credential value type

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Upper bound on a provider-supplied lifetime (ten years)
const MAX_EXPIRES_IN_SECS: u64 = 10 * 365 * 24 * 3600;

/// The access/refresh token pair currently used by this process
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Access token presented as the bearer credential
    pub access_token: String,

    /// Refresh token; single-use when the provider rotates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry of the access token
    pub expires_at: DateTime<Utc>,

    /// Granted scopes
    #[serde(default)]
    pub scope: BTreeSet<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Build a credential from token endpoint response fields
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        scope: Option<&str>,
    ) -> Self {
        let lifetime = expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .min(MAX_EXPIRES_IN_SECS);
        let lifetime = chrono::Duration::seconds(i64::try_from(lifetime).unwrap_or_default());

        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + lifetime,
            scope: scope.map(parse_scope).unwrap_or_default(),
            token_type: token_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(default_token_type),
        }
    }

    /// Successor of `previous` after a refresh response.
    ///
    /// A provider that does not rotate refresh tokens omits `refresh_token`;
    /// the previous one then stays valid and is carried over. Scope is
    /// carried over the same way.
    #[must_use]
    pub fn succeed(mut self, previous: &Credential) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token.clone_from(&previous.refresh_token);
        }
        if self.scope.is_empty() {
            self.scope.clone_from(&previous.scope);
        }
        self
    }

    /// Whether the access token is usable at `now`, keeping `margin` in reserve
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let Ok(margin) = chrono::Duration::from_std(margin) else {
            return false;
        };
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|deadline| now < deadline)
    }

    /// Whether the access token needs a refresh now
    #[must_use]
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        !self.is_valid_at(Utc::now(), margin)
    }

    /// Time until expiration, `None` once expired
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }

    /// `Authorization` header value
    #[must_use]
    pub fn authorization_header(&self) -> String {
        // Providers answer "bearer" as often as "Bearer"; servers expect the latter.
        if self.token_type.eq_ignore_ascii_case("bearer") {
            format!("Bearer {}", self.access_token)
        } else {
            format!("{} {}", self.token_type, self.access_token)
        }
    }

    /// Space-delimited scope string
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scope.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Split an OAuth scope string on whitespace
#[must_use]
pub fn parse_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// One-time authorization code obtained from the provider's redirect
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    /// Authorization code
    pub code: String,
    /// Redirect URI used when the code was issued
    pub redirect_uri: String,
}

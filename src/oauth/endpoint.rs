//! Token endpoint client
//!
//! Providers disagree on how the client secret travels (form body, JSON
//! body or HTTP Basic). The configured encodings are tried in order; the
//! next one is only tried when the provider rejected the client identity.
//! The first encoding the provider accepts is remembered and used alone
//! from then on.

use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AuthError, AuthErrorKind};

/// How the client identity is presented to the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `application/x-www-form-urlencoded` body carrying `client_id` and `client_secret`
    FormPost,
    /// `application/json` body carrying `client_id` and `client_secret`
    JsonBody,
    /// Form body plus `Authorization: Basic` client credentials (RFC 6749 §2.3.1)
    Basic,
}

impl ClientAuthMethod {
    /// Default preference order
    #[must_use]
    pub fn default_order() -> Vec<Self> {
        vec![Self::FormPost, Self::JsonBody, Self::Basic]
    }

    /// Config name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FormPost => "form_post",
            Self::JsonBody => "json_body",
            Self::Basic => "basic",
        }
    }
}

/// Grant presented to the token endpoint
#[derive(Debug, Clone, Copy)]
pub enum TokenGrant<'a> {
    /// `grant_type=authorization_code`
    AuthorizationCode {
        /// One-time code
        code: &'a str,
        /// Redirect URI the code was issued for
        redirect_uri: &'a str,
    },
    /// `grant_type=refresh_token`
    RefreshToken {
        /// Refresh token being spent
        refresh_token: &'a str,
    },
}

impl TokenGrant<'_> {
    fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Successful token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default, deserialize_with = "lossy_u64")]
    pub expires_in: Option<u64>,
    /// Refresh token (rotated)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope, space-delimited
    #[serde(default)]
    pub scope: Option<String>,
}

/// Some providers send `expires_in` as a string
fn lossy_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// RFC 6749 §5.2 error response
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for one provider's token endpoint
pub struct TokenEndpoint {
    http_client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    methods: Vec<ClientAuthMethod>,
    preferred: RwLock<Option<ClientAuthMethod>>,
}

impl TokenEndpoint {
    /// Create a token endpoint client. `http_client` must carry the request timeout.
    #[must_use]
    pub fn new(
        http_client: Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        methods: Vec<ClientAuthMethod>,
    ) -> Self {
        Self {
            http_client,
            token_url,
            client_id,
            client_secret,
            methods,
            preferred: RwLock::new(None),
        }
    }

    /// The encoding the provider accepted, once known
    #[must_use]
    pub fn preferred_method(&self) -> Option<ClientAuthMethod> {
        *self.preferred.read()
    }

    /// Client ID
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Present `grant` to the token endpoint
    pub async fn request(&self, grant: TokenGrant<'_>) -> Result<TokenResponse, AuthError> {
        let candidates = match self.preferred_method() {
            Some(method) => vec![method],
            None => self.methods.clone(),
        };

        let mut last_rejection = None;
        for method in candidates {
            match self.send_with(method, grant).await {
                Ok(response) => {
                    self.remember(method);
                    return Ok(response);
                }
                Err(e) if e.kind == AuthErrorKind::InvalidClient => {
                    debug!(method = method.as_str(), error = %e, "Client authentication rejected, trying next method");
                    last_rejection = Some(e);
                }
                Err(e) => {
                    // The provider got past client authentication
                    if matches!(e.kind, AuthErrorKind::InvalidGrant) {
                        self.remember(method);
                    }
                    return Err(e);
                }
            }
        }

        Err(last_rejection.unwrap_or_else(|| {
            AuthError::invalid_client("no client authentication method configured")
        }))
    }

    fn remember(&self, method: ClientAuthMethod) {
        let mut preferred = self.preferred.write();
        if *preferred != Some(method) {
            info!(method = method.as_str(), "Token endpoint client authentication method selected");
            *preferred = Some(method);
        }
    }

    fn grant_params(&self, grant: TokenGrant<'_>) -> Vec<(&'static str, String)> {
        let mut params = vec![("grant_type", grant.grant_type().to_string())];
        match grant {
            TokenGrant::AuthorizationCode { code, redirect_uri } => {
                params.push(("code", code.trim().to_string()));
                params.push(("redirect_uri", redirect_uri.trim().to_string()));
            }
            TokenGrant::RefreshToken { refresh_token } => {
                params.push(("refresh_token", refresh_token.to_string()));
            }
        }
        params
    }

    fn build_request(&self, method: ClientAuthMethod, grant: TokenGrant<'_>) -> RequestBuilder {
        let mut params = self.grant_params(grant);
        let request = self
            .http_client
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json");

        match method {
            ClientAuthMethod::FormPost => {
                params.push(("client_id", self.client_id.clone()));
                params.push(("client_secret", self.client_secret.clone()));
                request.form(&params)
            }
            ClientAuthMethod::JsonBody => {
                params.push(("client_id", self.client_id.clone()));
                params.push(("client_secret", self.client_secret.clone()));
                let body: serde_json::Map<String, Value> = params
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v)))
                    .collect();
                request.json(&body)
            }
            ClientAuthMethod::Basic => {
                params.push(("client_id", self.client_id.clone()));
                request
                    .basic_auth(
                        form_encode(&self.client_id),
                        Some(form_encode(&self.client_secret)),
                    )
                    .form(&params)
            }
        }
    }

    async fn send_with(
        &self,
        method: ClientAuthMethod,
        grant: TokenGrant<'_>,
    ) -> Result<TokenResponse, AuthError> {
        let grant_type = grant.grant_type();
        let response = self
            .build_request(method, grant)
            .send()
            .await
            .map_err(|e| classify_send_error(grant_type, &e))?;

        let status = response.status();
        // Past this point the provider has seen the request
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::network(format!("{grant_type} response lost: {e}")))?;

        if !status.is_success() {
            return Err(classify_error_response(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            AuthError::network(format!("{grant_type} response unreadable: {e}"))
        })?;
        if token.access_token.trim().is_empty() {
            return Err(AuthError::network(format!(
                "{grant_type} response missing access_token"
            )));
        }
        Ok(token)
    }
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn classify_send_error(grant_type: &str, e: &reqwest::Error) -> AuthError {
    if e.is_connect() {
        AuthError::not_sent(format!("{grant_type} request could not connect: {e}"))
    } else if e.is_timeout() {
        AuthError::network(format!("{grant_type} request timed out"))
    } else {
        AuthError::network(format!("{grant_type} request failed: {e}"))
    }
}

fn classify_error_response(status: StatusCode, body: &str) -> AuthError {
    let snippet: String = body.chars().take(240).collect();

    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => {
            let detail = match err.error_description {
                Some(desc) => format!("{} ({desc})", err.error),
                None => err.error.clone(),
            };
            let message = format!("HTTP {}: {detail}", status.as_u16());
            match err.error.as_str() {
                "invalid_client" => AuthError::invalid_client(message),
                "invalid_grant" => AuthError::invalid_grant(message),
                _ => AuthError::provider(message),
            }
        }
        Err(_) if status == StatusCode::UNAUTHORIZED => {
            AuthError::invalid_client(format!("HTTP 401: {snippet}"))
        }
        Err(_) => AuthError::provider(format!("HTTP {}: {snippet}", status.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_classified() {
        let e = classify_error_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"refresh token already used"}"#,
        );
        assert_eq!(e.kind, AuthErrorKind::InvalidGrant);
        assert!(e.message.contains("already used"));

        let e = classify_error_response(StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#);
        assert_eq!(e.kind, AuthErrorKind::InvalidClient);

        let e = classify_error_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid_scope"}"#);
        assert_eq!(e.kind, AuthErrorKind::ProviderError);
    }

    #[test]
    fn bare_401_is_client_rejection() {
        let e = classify_error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        assert_eq!(e.kind, AuthErrorKind::InvalidClient);
        let e = classify_error_response(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert_eq!(e.kind, AuthErrorKind::ProviderError);
        assert!(!e.retryable);
    }

    #[test]
    fn expires_in_accepts_strings() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"7200"}"#).unwrap();
        assert_eq!(token.expires_in, Some(7200));
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3600}"#).unwrap();
        assert_eq!(token.expires_in, Some(3600));
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(token.expires_in, None);
    }

    #[test]
    fn basic_credentials_are_form_encoded() {
        assert_eq!(form_encode("id:with/special"), "id%3Awith%2Fspecial");
    }

    #[test]
    fn method_names_match_config() {
        for method in ClientAuthMethod::default_order() {
            let json = serde_json::to_value(method).unwrap();
            assert_eq!(json, method.as_str());
        }
    }
}

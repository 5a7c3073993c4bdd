//! Error types for the OAuth bridge

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type alias for the OAuth bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error (stdio framing, writer gone)
    #[error("Transport error: {0}")]
    Transport(String),

    /// OAuth provider interaction failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Resource server call failed
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Credential storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a failed OAuth provider interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    /// Client identity or secret rejected (`invalid_client`)
    InvalidClient,
    /// Code or refresh token rejected, expired or already used (`invalid_grant`)
    InvalidGrant,
    /// Transport failure or timeout talking to the token endpoint
    Network,
    /// Any other provider-side failure
    ProviderError,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::Network => "network",
            Self::ProviderError => "provider_error",
        };
        f.write_str(s)
    }
}

/// Failure of a token endpoint operation.
///
/// `Clone` so that one refresh outcome can be handed to every caller that
/// waited on the same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("OAuth {kind}: {message}")]
pub struct AuthError {
    /// Error classification
    pub kind: AuthErrorKind,
    /// Human-readable detail (never contains token material)
    pub message: String,
    /// True only when the request provably never reached the provider
    pub retryable: bool,
}

impl AuthError {
    /// Build an error of the given kind
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    /// `invalid_client`
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidClient, message)
    }

    /// `invalid_grant`
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidGrant, message)
    }

    /// Provider-side failure
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::ProviderError, message)
    }

    /// Network failure whose delivery to the provider is unknown
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Network, message)
    }

    /// Network failure before the request left this process
    pub fn not_sent(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::network(message)
        }
    }
}

/// Failure of a forwarded call to the resource server
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    /// Credential missing, unobtainable, or rejected twice
    #[error("Resource server rejected the credential: {detail}")]
    AuthRejected {
        /// HTTP status of the final rejection, if the server was reached
        status: Option<u16>,
        /// Underlying token-manager failure, if that is why no credential was sent
        auth_kind: Option<AuthErrorKind>,
        /// Detail
        detail: String,
    },

    /// Non-2xx response other than 401/403
    #[error("Resource server returned HTTP {status}")]
    Upstream {
        /// HTTP status
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Network failure or timeout
    #[error("Resource server unavailable: {0}")]
    Unavailable(String),

    /// JSON-RPC error object returned by the resource server
    #[error("Resource server error {}: {}", .0.code, .0.message)]
    Remote(JsonRpcError),
}

impl From<AuthError> for ResourceError {
    fn from(err: AuthError) -> Self {
        Self::AuthRejected {
            status: None,
            auth_kind: Some(err.kind),
            detail: err.message,
        }
    }
}

impl ResourceError {
    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::AuthRejected { .. } => rpc_codes::AUTH_REJECTED,
            Self::Upstream { .. } => rpc_codes::UPSTREAM_ERROR,
            Self::Unavailable(_) => rpc_codes::UNAVAILABLE,
            Self::Remote(e) => e.code,
        }
    }
}

/// JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Resource server unreachable or timed out
    pub const UNAVAILABLE: i32 = -32000;
    /// Token endpoint operation failed
    pub const AUTH_ERROR: i32 = -32001;
    /// Resource server rejected the credential
    pub const AUTH_REJECTED: i32 = -32002;
    /// Resource server returned a non-2xx status
    pub const UPSTREAM_ERROR: i32 = -32003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_converts_to_auth_rejected() {
        let err: ResourceError = AuthError::invalid_grant("refresh token revoked").into();
        match err {
            ResourceError::AuthRejected {
                status, auth_kind, ..
            } => {
                assert_eq!(status, None);
                assert_eq!(auth_kind, Some(AuthErrorKind::InvalidGrant));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn only_not_sent_errors_are_retryable() {
        assert!(AuthError::not_sent("connect refused").retryable);
        assert!(!AuthError::network("timed out").retryable);
        assert!(!AuthError::invalid_client("bad secret").retryable);
    }

    #[test]
    fn rpc_codes_per_variant() {
        assert_eq!(
            ResourceError::Unavailable("x".into()).to_rpc_code(),
            rpc_codes::UNAVAILABLE
        );
        assert_eq!(
            ResourceError::Upstream {
                status: 500,
                body: String::new()
            }
            .to_rpc_code(),
            rpc_codes::UPSTREAM_ERROR
        );
        assert_eq!(
            ResourceError::from(AuthError::provider("boom")).to_rpc_code(),
            rpc_codes::AUTH_REJECTED
        );
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_value(AuthErrorKind::InvalidGrant).unwrap();
        assert_eq!(json, "invalid_grant");
        assert_eq!(AuthErrorKind::ProviderError.to_string(), "provider_error");
    }
}

//! Request routing
//!
//! `auth/*` methods are answered locally from the token manager; everything
//! matching a forward pattern goes to the resource server. Every failure is
//! turned into a JSON-RPC error here, so nothing propagates past the bridge.

use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{AuthError, ResourceError, rpc_codes};
use crate::oauth::{AuthorizationGrant, OAuthTokenManager};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::resource::ResourceClient;
use crate::transport::Dispatch;
use crate::{Error, Result};

/// Prefix of locally handled methods
const AUTH_PREFIX: &str = "auth/";

/// `auth/exchange` parameters
#[derive(Debug, Deserialize)]
struct ExchangeParams {
    code: String,
    #[serde(default)]
    redirect_uri: Option<String>,
}

/// Maps methods to the local auth handlers or the resource server
pub struct RequestRouter {
    tokens: Arc<OAuthTokenManager>,
    resource: Arc<ResourceClient>,
    forward: Vec<Pattern>,
    default_redirect_uri: String,
}

impl RequestRouter {
    /// Create a router
    ///
    /// # Errors
    ///
    /// Returns an error if a forward pattern is not a valid glob.
    pub fn new(
        tokens: Arc<OAuthTokenManager>,
        resource: Arc<ResourceClient>,
        forward: &[String],
        default_redirect_uri: String,
    ) -> Result<Self> {
        let forward = forward
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| Error::Config(format!("Invalid forward pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tokens,
            resource,
            forward,
            default_redirect_uri,
        })
    }

    /// Whether `method` is sent to the resource server
    #[must_use]
    pub fn is_forwarded(&self, method: &str) -> bool {
        !method.starts_with(AUTH_PREFIX) && self.forward.iter().any(|p| p.matches(method))
    }

    /// Answer a request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        if method.starts_with(AUTH_PREFIX) {
            return self.handle_auth(id, &method, params).await;
        }

        if !self.is_forwarded(&method) {
            return method_not_found(id, &method);
        }

        match self.resource.call(&method, params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                warn!(method = %method, error = %e, "Forwarded call failed");
                resource_error_response(id, e)
            }
        }
    }

    /// Forward a notification; failures are only logged
    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        let method = notification.method;
        if !self.is_forwarded(&method) {
            debug!(method = %method, "Dropping notification that is not forwarded");
            return;
        }

        if let Err(e) = self.resource.notify(&method, notification.params).await {
            warn!(method = %method, error = %e, "Forwarded notification failed");
        }
    }

    async fn handle_auth(&self, id: RequestId, method: &str, params: Option<Value>) -> JsonRpcResponse {
        let outcome = match method {
            "auth/status" => Ok(()),
            "auth/exchange" => {
                let params: ExchangeParams =
                    match serde_json::from_value(params.unwrap_or(Value::Null)) {
                        Ok(params) => params,
                        Err(e) => {
                            return JsonRpcResponse::error_with_data(
                                id,
                                rpc_codes::INVALID_PARAMS,
                                "Invalid params",
                                Value::String(format!("auth/exchange expects {{code, redirect_uri?}}: {e}")),
                            );
                        }
                    };
                if params.code.trim().is_empty() {
                    return JsonRpcResponse::error_with_data(
                        id,
                        rpc_codes::INVALID_PARAMS,
                        "Invalid params",
                        Value::String("auth/exchange: code is empty".to_string()),
                    );
                }
                let grant = AuthorizationGrant {
                    code: params.code,
                    redirect_uri: params
                        .redirect_uri
                        .unwrap_or_else(|| self.default_redirect_uri.clone()),
                };
                self.tokens.exchange_authorization_code(&grant).await.map(drop)
            }
            "auth/refresh" => self.tokens.refresh().await.map(drop),
            _ => return method_not_found(id, method),
        };

        match outcome {
            Ok(()) => match serde_json::to_value(self.tokens.status()) {
                Ok(status) => JsonRpcResponse::success(id, status),
                Err(e) => JsonRpcResponse::error(id, rpc_codes::INTERNAL_ERROR, e.to_string()),
            },
            Err(e) => self.auth_error_response(id, &e),
        }
    }

    fn auth_error_response(&self, id: RequestId, err: &AuthError) -> JsonRpcResponse {
        JsonRpcResponse::error_with_data(
            id,
            rpc_codes::AUTH_ERROR,
            err.to_string(),
            json!({
                "kind": err.kind,
                "detail": err.message,
                "reauthorization_required": self.tokens.reauthorization_required().is_some(),
            }),
        )
    }
}

#[async_trait]
impl Dispatch for RequestRouter {
    async fn dispatch(&self, message: IncomingMessage) -> Option<JsonRpcResponse> {
        match message {
            IncomingMessage::Request(request) => Some(self.handle_request(request).await),
            IncomingMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
        }
    }
}

fn method_not_found(id: RequestId, method: &str) -> JsonRpcResponse {
    JsonRpcResponse::error_with_data(
        id,
        rpc_codes::METHOD_NOT_FOUND,
        "Method not found",
        json!({ "method": method }),
    )
}

/// JSON-RPC error for a failed forwarded call
#[must_use]
pub fn resource_error_response(id: RequestId, err: ResourceError) -> JsonRpcResponse {
    let code = err.to_rpc_code();
    let message = err.to_string();
    match err {
        ResourceError::AuthRejected {
            status,
            auth_kind,
            detail,
        } => JsonRpcResponse::error_with_data(
            id,
            code,
            message,
            json!({
                "kind": "auth_rejected",
                "status": status,
                "auth_kind": auth_kind,
                "detail": detail,
            }),
        ),
        ResourceError::Upstream { status, body } => JsonRpcResponse::error_with_data(
            id,
            code,
            message,
            json!({ "kind": "upstream", "status": status, "body": body }),
        ),
        ResourceError::Unavailable(detail) => JsonRpcResponse::error_with_data(
            id,
            code,
            message,
            json!({ "kind": "unavailable", "detail": detail }),
        ),
        ResourceError::Remote(error) => JsonRpcResponse::from_error(id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthErrorKind;
    use crate::protocol::JsonRpcError;

    #[test]
    fn upstream_error_carries_status_and_body() {
        let response = resource_error_response(
            RequestId::Number(4.into()),
            ResourceError::Upstream {
                status: 502,
                body: "bad gateway".into(),
            },
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_codes::UPSTREAM_ERROR);
        assert_eq!(
            error.data,
            Some(json!({"kind": "upstream", "status": 502, "body": "bad gateway"}))
        );
        assert_eq!(response.id, RequestId::Number(4.into()));
    }

    #[test]
    fn auth_rejection_carries_auth_kind() {
        let response = resource_error_response(
            RequestId::String("a".into()),
            AuthError::invalid_grant("revoked").into(),
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_codes::AUTH_REJECTED);
        let data = error.data.unwrap();
        assert_eq!(data["auth_kind"], json!(AuthErrorKind::InvalidGrant));
        assert_eq!(data["status"], Value::Null);
    }

    #[test]
    fn remote_error_passes_through() {
        let remote = JsonRpcError {
            code: -32050,
            message: "tool failed".into(),
            data: Some(json!({"tool": "x"})),
        };
        let response =
            resource_error_response(RequestId::Number(1.into()), ResourceError::Remote(remote.clone()));
        assert_eq!(response.error, Some(remote));
    }

    #[test]
    fn unavailable_maps_to_server_error() {
        let response = resource_error_response(
            RequestId::Null,
            ResourceError::Unavailable("timed out".into()),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::UNAVAILABLE);
    }
}

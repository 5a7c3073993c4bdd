//! Resource server client
//!
//! Forwards JSON-RPC calls over HTTP with the current bearer credential.
//! A 401/403 answer triggers one credential refresh and exactly one retry.
//! Responses may come back as plain JSON or as a short `text/event-stream`
//! carrying the JSON-RPC reply in its first `data:` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ResourceConfig;
use crate::error::ResourceError;
use crate::oauth::{Credential, OAuthTokenManager};
use crate::protocol::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, PROTOCOL_VERSION, RequestId,
};
use crate::{Error, Result};

/// Response header carrying the server-assigned session
const SESSION_HEADER: &str = "mcp-session-id";

/// Request header announcing the protocol revision
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Longest response body kept in an `Upstream` error
const MAX_ERROR_BODY_CHARS: usize = 2048;

/// HTTP client for the protected resource server
pub struct ResourceClient {
    http_client: Client,
    url: String,
    headers: HeaderMap,
    tokens: Arc<OAuthTokenManager>,
    session_id: RwLock<Option<String>>,
    request_id: AtomicI64,
}

impl ResourceClient {
    /// Create a client for `url`
    ///
    /// # Errors
    ///
    /// Returns an error if a configured header is not a valid HTTP header
    /// or the HTTP client cannot be built.
    pub fn new(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
        tokens: Arc<OAuthTokenManager>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name: HeaderName = key
                .parse()
                .map_err(|e| Error::Config(format!("Invalid header name {key:?}: {e}")))?;
            let value: HeaderValue = value
                .parse()
                .map_err(|e| Error::Config(format!("Invalid value for header {key:?}: {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            http_client,
            url: url.to_string(),
            headers: header_map,
            tokens,
            session_id: RwLock::new(None),
            request_id: AtomicI64::new(1),
        })
    }

    /// Create from config
    pub fn from_config(config: &ResourceConfig, tokens: Arc<OAuthTokenManager>) -> Result<Self> {
        Self::new(&config.url, &config.headers, config.timeout, tokens)
    }

    /// Resource server endpoint
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session id assigned by the server, once seen
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Forward a request and return its `result`
    pub async fn call(&self, method: &str, params: Option<Value>) -> std::result::Result<Value, ResourceError> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let body = serde_json::to_value(&request)
            .map_err(|e| ResourceError::Unavailable(format!("request not serializable: {e}")))?;

        let response = self.send(method, &body).await?;
        decode_response(response).await
    }

    /// Forward a notification; the response body is ignored
    pub async fn notify(&self, method: &str, params: Option<Value>) -> std::result::Result<(), ResourceError> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        };
        let body = serde_json::to_value(&notification)
            .map_err(|e| ResourceError::Unavailable(format!("notification not serializable: {e}")))?;

        self.send(method, &body).await.map(drop)
    }

    /// POST `body` with the current credential, refreshing and retrying
    /// once if the server rejects it
    async fn send(&self, method: &str, body: &Value) -> std::result::Result<Response, ResourceError> {
        let credential = self.tokens.get_valid_credential().await?;
        let response = self.post(&credential, body).await?;

        let response = if is_rejection(response.status()) {
            warn!(
                method = %method,
                status = response.status().as_u16(),
                "Resource server rejected credential, refreshing"
            );
            let fresh = self.tokens.refresh_after_rejection(&credential).await?;
            let retried = self.post(&fresh, body).await?;

            let status = retried.status();
            if is_rejection(status) {
                let detail = read_snippet(retried).await;
                return Err(ResourceError::AuthRejected {
                    status: Some(status.as_u16()),
                    auth_kind: None,
                    detail: if detail.is_empty() {
                        format!("HTTP {} after credential refresh", status.as_u16())
                    } else {
                        detail
                    },
                });
            }
            retried
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ResourceError::Upstream {
                status: status.as_u16(),
                body: read_snippet(response).await,
            });
        }

        Ok(response)
    }

    async fn post(&self, credential: &Credential, body: &Value) -> std::result::Result<Response, ResourceError> {
        let mut headers = self.headers.clone();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );

        let mut request = self
            .http_client
            .post(&self.url)
            .headers(headers)
            .header(header::AUTHORIZATION, credential.authorization_header())
            .json(body);

        if let Some(ref session_id) = *self.session_id.read() {
            request = request.header(SESSION_HEADER, session_id.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ResourceError::Unavailable(format!("request to {} timed out", self.url))
            } else {
                ResourceError::Unavailable(format!("request to {} failed: {e}", self.url))
            }
        })?;

        self.remember_session(&response);
        Ok(response)
    }

    fn remember_session(&self, response: &Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };

        let mut session = self.session_id.write();
        if session.as_deref() != Some(id) {
            info!(session_id = %id, "Stored resource server session ID");
            *session = Some(id.to_string());
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed).into())
    }
}

fn is_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn read_snippet(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Turn a 2xx response into the call result
async fn decode_response(response: Response) -> std::result::Result<Value, ResourceError> {
    let status = response.status();
    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    let text = response
        .text()
        .await
        .map_err(|e| ResourceError::Unavailable(format!("response body lost: {e}")))?;

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let payload = if is_event_stream {
        first_event_payload(&text)
    } else {
        serde_json::from_str(&text).ok()
    };

    match payload {
        Some(value) => unwrap_envelope(value),
        None => Err(ResourceError::Upstream {
            status: status.as_u16(),
            body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        }),
    }
}

/// First `data:` event that parses as a JSON-RPC response
fn first_event_payload(text: &str) -> Option<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|value| value.get("result").is_some() || value.get("error").is_some())
}

/// Pull `result` out of a JSON-RPC envelope; anything else is returned as-is
fn unwrap_envelope(value: Value) -> std::result::Result<Value, ResourceError> {
    let is_envelope = value.get("jsonrpc").is_some()
        && (value.get("result").is_some() || value.get("error").is_some());
    if !is_envelope {
        return Ok(value);
    }

    let Value::Object(mut map) = value else {
        return Ok(Value::Null);
    };

    if let Some(error) = map.remove("error").filter(|e| !e.is_null()) {
        let error: JsonRpcError = serde_json::from_value(error.clone()).unwrap_or(JsonRpcError {
            code: crate::error::rpc_codes::INTERNAL_ERROR,
            message: "malformed error object from resource server".to_string(),
            data: Some(error),
        });
        debug!(code = error.code, "Resource server returned JSON-RPC error");
        return Err(ResourceError::Remote(error));
    }

    Ok(map.remove("result").unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_result_is_unwrapped() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert_eq!(unwrap_envelope(value).unwrap(), json!({"tools": []}));
    }

    #[test]
    fn envelope_error_becomes_remote() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}});
        match unwrap_envelope(value) {
            Err(ResourceError::Remote(e)) => {
                assert_eq!(e.code, -32601);
                assert_eq!(e.message, "nope");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn plain_json_passes_through() {
        let value = json!({"items": [1, 2, 3]});
        assert_eq!(unwrap_envelope(value.clone()).unwrap(), value);
    }

    #[test]
    fn malformed_error_object_is_kept_as_data() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "error": "boom"});
        match unwrap_envelope(value) {
            Err(ResourceError::Remote(e)) => assert_eq!(e.data, Some(json!("boom"))),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn event_stream_first_response_event() {
        let text = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n";
        let payload = first_event_payload(text).unwrap();
        assert_eq!(payload["id"], 3);
        assert_eq!(unwrap_envelope(payload).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn event_stream_without_response() {
        assert!(first_event_payload("event: ping\ndata: not json\n\n").is_none());
    }
}

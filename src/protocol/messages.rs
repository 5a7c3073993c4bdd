//! JSON-RPC message types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::JSONRPC_VERSION;

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response.
///
/// `id` is always serialized, as `null` when the request id could not be
/// recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Result (on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: RequestId, code: i32, message: impl Into<String>) -> Self {
        Self::from_error(
            id,
            JsonRpcError {
                code,
                message: message.into(),
                data: None,
            },
        )
    }

    /// Create an error response with data
    pub fn error_with_data(
        id: RequestId,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::from_error(
            id,
            JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            },
        )
    }

    /// Wrap an existing error object
    #[must_use]
    pub fn from_error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID (string, number, or null)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID, kept as parsed so any JSON number round-trips
    Number(serde_json::Number),
    /// Explicit `null` id, also used when the id cannot be recovered
    Null,
}

impl RequestId {
    /// Interpret a raw JSON `id` member
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s)),
            Value::Number(n) => Some(Self::Number(n)),
            Value::Null => Some(Self::Null),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Null => f.write_str("null"),
        }
    }
}

/// A message read from the client: a request (answered) or a notification
/// (not answered)
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Request
    Request(JsonRpcRequest),
    /// Notification
    Notification(JsonRpcNotification),
}

/// A parsed JSON value that is not a valid JSON-RPC request
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRequest {
    /// Id to answer with (null when not recoverable)
    pub id: RequestId,
    /// What was wrong
    pub reason: String,
}

impl InvalidRequest {
    fn new(id: RequestId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl IncomingMessage {
    /// Validate a parsed JSON value as a JSON-RPC 2.0 request or notification.
    ///
    /// An absent `id` member makes a notification; `"id": null` is a request.
    pub fn from_value(value: Value) -> std::result::Result<Self, InvalidRequest> {
        let mut map: Map<String, Value> = match value {
            Value::Object(map) => map,
            Value::Array(_) => {
                return Err(InvalidRequest::new(
                    RequestId::Null,
                    "batch requests are not supported",
                ));
            }
            _ => {
                return Err(InvalidRequest::new(
                    RequestId::Null,
                    "request must be a JSON object",
                ));
            }
        };

        let id = match map.remove("id") {
            None => None,
            Some(raw) => Some(RequestId::from_value(raw).ok_or_else(|| {
                InvalidRequest::new(RequestId::Null, "id must be a string, number or null")
            })?),
        };
        let answer_id = id.clone().unwrap_or(RequestId::Null);

        match map.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => {
                return Err(InvalidRequest::new(answer_id, "jsonrpc must be \"2.0\""));
            }
        }

        let method = match map.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(InvalidRequest::new(answer_id, "method must be a string")),
        };

        let params = match map.remove("params") {
            None | Some(Value::Null) => None,
            Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
            Some(_) => {
                return Err(InvalidRequest::new(
                    answer_id,
                    "params must be an object or array",
                ));
            }
        };

        Ok(match id {
            Some(id) => Self::Request(JsonRpcRequest::new(id, method, params)),
            None => Self::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            }),
        })
    }

    /// Method name
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Request(r) => &r.method,
            Self::Notification(n) => &n.method,
        }
    }

    /// Request id, `None` for notifications
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }
}

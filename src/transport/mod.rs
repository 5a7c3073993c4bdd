//! Stdio transport between the local JSON-RPC client and the router

mod pending;
mod stdio;

pub use self::pending::{PendingRequest, PendingRequests};
pub use self::stdio::LineBridge;

use async_trait::async_trait;

use crate::protocol::{IncomingMessage, JsonRpcResponse};

/// Handles one parsed message read from the client
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Process `message`. Requests return the response to write;
    /// notifications return `None`.
    async fn dispatch(&self, message: IncomingMessage) -> Option<JsonRpcResponse>;
}

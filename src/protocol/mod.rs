//! JSON-RPC 2.0 wire types

mod messages;

pub use messages::*;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version sent to the resource server
pub const PROTOCOL_VERSION: &str = "2025-03-26";

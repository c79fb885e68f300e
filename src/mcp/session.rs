//! Seams between the connection registry and live MCP sessions.

use std::sync::Arc;

use async_trait::async_trait;

use super::schema::ToolSchema;
use crate::config::ServerConfig;
use crate::error::Result;

/// One live, initialized client session with an upstream server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Enumerate the tools the server currently offers.
    async fn list_tools(&self) -> Result<Vec<ToolSchema>>;

    /// Invoke a tool. Remote failures surface as `BridgeError::ToolExecution`,
    /// broken transports as `BridgeError::Connection`.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Whether the underlying transport has gone away.
    async fn is_closed(&self) -> bool;

    /// Tear the session down. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions for server configs.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn ToolSession>>;
}

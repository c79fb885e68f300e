//! Model Context Protocol (MCP) client sessions and transports.

pub mod client;
pub mod schema;
pub mod session;
pub mod transport;

pub use client::{McpConnector, McpSession};
pub use schema::{ToolDescriptor, ToolSchema};
pub use session::{ServerConnector, ToolSession};

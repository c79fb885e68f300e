//! mcp-bridge: MCP tool servers in, webhooks out
//!
//! Keeps live sessions to Model Context Protocol servers (stdio child
//! processes or streamable HTTP), runs tool calls against them with a
//! timeout, and fans the resulting events out to registered webhooks with
//! filtering, batching, retry, and auto-disable.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_bridge::{Bridge, BridgeConfig, ExecuteToolRequest};
//! use serde_json::json;
//!
//! # async fn example() -> mcp_bridge::error::Result<()> {
//! let config = BridgeConfig::from_env()?;
//! let bridge = Bridge::from_config(&config).await?;
//! let execution = bridge
//!     .execute_tool(ExecuteToolRequest::new("filesystem", "read_file", json!({"path": "README.md"})))
//!     .await?;
//! println!("{}", execution.success);
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod mcp;
pub mod util;
pub mod webhook;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, ExecuteOptions, ExecuteToolRequest, HealthReport};
pub use config::{BridgeConfig, ServerConfig, StoreConfig, TransportConfig};
pub use connection::{ConnectionRegistry, ConnectionSnapshot, ConnectionState, ReconnectPolicy};
pub use error::{BridgeError, ErrorCategory, Result};
pub use events::{DomainEvent, EventSink, EventType};
pub use gateway::{ToolExecution, ToolGateway};
pub use webhook::{
    DeliveryMode, DeliveryPolicy, EventDispatcher, NewSubscription, Subscription,
    SubscriptionRegistry, SubscriptionUpdate, WebhookOptions,
};

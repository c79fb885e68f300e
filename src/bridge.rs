//! The `Bridge` facade: one handle over connections, tool calls, and webhooks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BridgeConfig, ServerConfig};
use crate::connection::{ConnectionRegistry, ConnectionSnapshot};
use crate::error::{BridgeError, Result};
use crate::events::EventSink;
use crate::gateway::{ToolExecution, ToolGateway};
use crate::mcp::{McpConnector, ServerConnector, ToolDescriptor};
use crate::webhook::{
    open_store, EventDispatcher, HttpWebhookSender, KeyValueStore, NewSubscription,
    Subscription, SubscriptionRegistry, SubscriptionUpdate, WebhookSender,
};

/// Inbound tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteToolRequest {
    pub server: String,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    /// Milliseconds. Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ExecuteToolRequest {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            parameters,
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub connected_servers: usize,
    pub active_webhooks: usize,
}

/// Owns the connection registry, the gateway, and the event dispatcher.
pub struct Bridge {
    connections: ConnectionRegistry,
    gateway: ToolGateway,
    dispatcher: EventDispatcher,
    started_at: Instant,
}

impl Bridge {
    /// Assemble the components and load persisted subscriptions.
    /// No servers are connected yet; see [`connect_all`](Self::connect_all).
    pub async fn new(
        connector: Arc<dyn ServerConnector>,
        store: Arc<dyn KeyValueStore>,
        sender: Arc<dyn WebhookSender>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let subscriptions = Arc::new(SubscriptionRegistry::new(store));
        subscriptions.load().await?;

        let dispatcher = EventDispatcher::new(subscriptions, sender, config.delivery.clone());
        let sink: Arc<dyn EventSink> = Arc::new(dispatcher.clone());
        let connections =
            ConnectionRegistry::new(connector, Arc::clone(&sink), config.reconnect.clone());
        let gateway = ToolGateway::new(connections.clone(), sink, config.tool_timeout);

        Ok(Self {
            connections,
            gateway,
            dispatcher,
            started_at: Instant::now(),
        })
    }

    /// Production wiring: configured store, reqwest sender, rmcp connector,
    /// and every server from the configured list.
    pub async fn from_config(config: &BridgeConfig) -> Result<Self> {
        let store = open_store(&config.store).await?;
        let sender = HttpWebhookSender::new(config.delivery.request_timeout)?;
        let servers = config.load_servers()?;

        let bridge = Self::new(Arc::new(McpConnector), store, Arc::new(sender), config).await?;
        let connected = bridge.connect_all(servers).await;
        tracing::info!(connected, "MCP bridge started");
        Ok(bridge)
    }

    /// Connect each server. Invalid entries are logged and skipped.
    /// Returns how many ended up connected.
    pub async fn connect_all(&self, servers: Vec<ServerConfig>) -> usize {
        let mut connected = 0;
        for config in servers {
            let id = config.id.clone();
            match self.connections.connect(config).await {
                Ok(snapshot) if snapshot.connected => connected += 1,
                Ok(_) => {}
                Err(error) => tracing::error!(server = %id, error = %error, "Skipping server"),
            }
        }
        connected
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub async fn execute_tool(&self, request: ExecuteToolRequest) -> Result<ToolExecution> {
        let timeout = match request.options.timeout {
            Some(0) => {
                return Err(BridgeError::InvalidArgument(
                    "timeout must be greater than zero".into(),
                ))
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        self.gateway
            .execute_tool(&request.server, &request.tool, request.parameters, timeout)
            .await
    }

    pub async fn list_servers(&self) -> Vec<ConnectionSnapshot> {
        self.connections.list_connections().await
    }

    pub async fn get_server(&self, id: &str) -> Result<ConnectionSnapshot> {
        self.connections
            .get_connection(id)
            .await
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))
    }

    pub async fn list_server_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>> {
        self.connections.list_tools(id).await
    }

    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        self.connections.list_all_tools().await
    }

    pub async fn connect_server(&self, config: ServerConfig) -> Result<ConnectionSnapshot> {
        self.connections.connect(config).await
    }

    /// Idempotent. Returns whether the server was registered.
    pub async fn disconnect_server(&self, id: &str) -> bool {
        self.connections.disconnect(id).await
    }

    pub async fn reconnect_server(&self, id: &str) -> Result<ConnectionSnapshot> {
        self.connections.reconnect(id).await
    }

    pub async fn create_webhook(&self, request: NewSubscription) -> Result<Subscription> {
        self.dispatcher.subscriptions().create(request).await
    }

    pub async fn list_webhooks(&self) -> Vec<Subscription> {
        self.dispatcher.subscriptions().list().await
    }

    pub async fn get_webhook(&self, id: &str) -> Result<Subscription> {
        self.dispatcher.subscriptions().get(id).await
    }

    pub async fn update_webhook(&self, id: &str, update: SubscriptionUpdate) -> Result<Subscription> {
        self.dispatcher.subscriptions().update(id, update).await
    }

    pub async fn delete_webhook(&self, id: &str) -> Result<()> {
        self.dispatcher.remove_subscription(id).await
    }

    /// Dispatch a sample event of the webhook's type. Returns the match count.
    pub async fn test_webhook(&self, id: &str) -> Result<usize> {
        self.dispatcher.test_subscription(id).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".into(),
            timestamp: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").into(),
            connected_servers: self.connections.connected_count().await,
            active_webhooks: self.dispatcher.subscriptions().active_count().await,
        }
    }

    /// Close every transport, then flush pending batches.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down MCP bridge");
        let closed = self.connections.shutdown().await;
        self.dispatcher.shutdown().await;
        tracing::info!(closed_connections = closed, "MCP bridge stopped");
    }
}

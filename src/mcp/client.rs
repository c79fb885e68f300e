//! rmcp-backed client sessions.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParams, CallToolResult, Content, JsonObject, ProtocolVersion,
        ResourceContents,
    },
    service::{ClientInitializeError, Peer, RoleClient, ServiceError},
};
use tokio::sync::Mutex;

use super::schema::ToolSchema;
use super::session::{ServerConnector, ToolSession};
use super::transport::{transport_for, MCPRunningService, MCPTransport};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};

/// Output of a successful tool call.
#[derive(Debug, Clone)]
pub struct ToolCallOutput {
    pub structured_content: Option<serde_json::Value>,
    pub text_content: Option<String>,
    pub content: Vec<serde_json::Value>,
}

impl ToolCallOutput {
    /// Structured content if present, then joined text, then raw content items.
    pub fn into_value(self) -> serde_json::Value {
        if let Some(structured) = self.structured_content {
            return structured;
        }
        if let Some(text) = self.text_content {
            return serde_json::Value::String(text);
        }
        serde_json::Value::Array(self.content)
    }
}

/// An initialized session with one MCP server.
pub struct McpSession {
    server_id: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<MCPRunningService>>,
}

impl McpSession {
    /// Connect through `transport`, falling back to the 2024-11-05 protocol
    /// when the server rejects the latest version.
    pub async fn connect(
        server_id: impl Into<String>,
        transport: &mut dyn MCPTransport,
    ) -> Result<Self> {
        let service = connect_with_protocol_fallback(transport).await?;
        Ok(Self::from_running_service(server_id, service))
    }

    /// Wrap an already-running rmcp service.
    pub fn from_running_service(server_id: impl Into<String>, service: MCPRunningService) -> Self {
        Self {
            server_id: server_id.into(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Call a tool and keep the full result shape.
    pub async fn call_tool_output(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutput> {
        let arguments = coerce_tool_arguments(arguments)?;
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|error| map_service_error(name, error))?;

        map_call_result(name, result)
    }
}

#[async_trait]
impl ToolSession for McpSession {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(ServiceError::UnexpectedResponse) => self
                .peer
                .list_tools(None)
                .await
                .map(|page| page.tools)
                .map_err(|error| map_service_error("list_tools", error))?,
            Err(error) => return Err(map_service_error("list_tools", error)),
        };

        Ok(tools.into_iter().map(map_mcp_tool_schema).collect())
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        self.call_tool_output(name, arguments)
            .await
            .map(ToolCallOutput::into_value)
    }

    async fn is_closed(&self) -> bool {
        match self.service.lock().await.as_ref() {
            Some(service) => service.is_closed(),
            None => true,
        }
    }

    async fn close(&self) -> Result<()> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        service.cancel().await.map_err(|e| {
            BridgeError::Connection(format!(
                "{}: failed to stop MCP session: {e}",
                self.server_id
            ))
        })?;
        tracing::debug!(server = %self.server_id, "MCP session closed");
        Ok(())
    }
}

/// Production connector: builds the configured transport and handshakes.
#[derive(Debug, Default, Clone, Copy)]
pub struct McpConnector;

#[async_trait]
impl ServerConnector for McpConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn ToolSession>> {
        let mut transport = transport_for(&config.transport);
        tracing::debug!(
            server = %config.id,
            transport = transport.kind(),
            "Opening MCP session"
        );
        let session = McpSession::connect(config.id.clone(), transport.as_mut()).await?;
        Ok(Arc::new(session))
    }
}

async fn connect_with_protocol_fallback(
    transport: &mut dyn MCPTransport,
) -> Result<MCPRunningService> {
    let latest_client_info = rmcp::model::ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        ..Default::default()
    };

    match transport.connect(latest_client_info).await {
        Ok(session) => return Ok(session),
        Err(error) if should_retry_protocol_fallback(&error) => {
            tracing::debug!(error = %error, "Retrying MCP handshake with legacy protocol");
        }
        Err(error) => return Err(map_client_initialize_error(error)),
    }

    let fallback_client_info = rmcp::model::ClientInfo {
        protocol_version: ProtocolVersion::V_2024_11_05,
        ..Default::default()
    };
    transport
        .connect(fallback_client_info)
        .await
        .map_err(map_client_initialize_error)
}

fn should_retry_protocol_fallback(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

fn map_mcp_tool_schema(tool: rmcp::model::Tool) -> ToolSchema {
    ToolSchema {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
    }
}

fn coerce_tool_arguments(value: serde_json::Value) -> Result<Option<JsonObject>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(map)),
        serde_json::Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
                BridgeError::InvalidArgument(format!("tool arguments must be valid JSON: {e}"))
            })?;
            coerce_tool_arguments(parsed)
        }
        other => Err(BridgeError::InvalidArgument(format!(
            "tool arguments must be a JSON object; got {other}"
        ))),
    }
}

fn extract_text_content(content: &[Content]) -> Option<String> {
    let mut lines = Vec::new();
    for item in content {
        if let Some(text) = item.as_text() {
            lines.push(text.text.clone());
            continue;
        }
        if let Some(resource) = item.as_resource() {
            if let ResourceContents::TextResourceContents { text, .. } = &resource.resource {
                lines.push(text.clone());
            }
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn map_call_result(name: &str, result: CallToolResult) -> Result<ToolCallOutput> {
    let text_content = extract_text_content(&result.content);
    let content = result
        .content
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect::<Vec<_>>();

    if result.is_error.unwrap_or(false) {
        let message = text_content
            .clone()
            .or_else(|| result.structured_content.as_ref().map(|v| v.to_string()))
            .unwrap_or_else(|| "tool returned an error result".into());

        return Err(BridgeError::ToolExecution {
            tool_name: name.to_string(),
            message,
        });
    }

    Ok(ToolCallOutput {
        structured_content: result.structured_content,
        text_content,
        content,
    })
}

fn map_client_initialize_error(error: ClientInitializeError) -> BridgeError {
    match error {
        ClientInitializeError::ConnectionClosed(context) => {
            BridgeError::Connection(format!("initialize connection closed: {context}"))
        }
        ClientInitializeError::TransportError { error, context } => {
            BridgeError::Connection(format!("initialize transport error ({context}): {error}"))
        }
        ClientInitializeError::JsonRpcError(error) => BridgeError::Connection(format!(
            "initialize JSON-RPC error {}: {}",
            error.code.0, error.message
        )),
        ClientInitializeError::Cancelled => BridgeError::Connection("initialize cancelled".into()),
        other => BridgeError::Connection(format!("initialize error: {other}")),
    }
}

/// Transport-level failures become `Connection`; everything the server said
/// back becomes `ToolExecution` against `context`.
fn map_service_error(context: &str, error: ServiceError) -> BridgeError {
    match error {
        ServiceError::McpError(error) => BridgeError::ToolExecution {
            tool_name: context.to_string(),
            message: format!("MCP error {}: {}", error.code.0, error.message),
        },
        ServiceError::TransportSend(error) => {
            BridgeError::Connection(format!("{context}: transport send failed: {error}"))
        }
        ServiceError::TransportClosed => {
            BridgeError::Connection(format!("{context}: transport closed"))
        }
        ServiceError::UnexpectedResponse => BridgeError::ToolExecution {
            tool_name: context.to_string(),
            message: "unexpected MCP response".into(),
        },
        ServiceError::Cancelled { reason } => {
            let suffix = reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            BridgeError::Connection(format!("{context}: request cancelled{suffix}"))
        }
        other => BridgeError::ToolExecution {
            tool_name: context.to_string(),
            message: format!("MCP service error: {other}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::{
        model::ServerJsonRpcMessage,
        service::{serve_directly, RxJsonRpcMessage, ServiceExt, TxJsonRpcMessage},
        transport::Transport as RmcpTransport,
    };
    use serde_json::json;
    use std::{collections::VecDeque, io, sync::Mutex as StdMutex};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    enum ScriptedServer {
        DisconnectOnCallTool,
        ListTools { tool_names: Vec<String> },
        CallTool { is_error: bool },
    }

    struct ChannelRmcpTransport {
        outbound: UnboundedSender<TxJsonRpcMessage<RoleClient>>,
        inbound: UnboundedReceiver<RxJsonRpcMessage<RoleClient>>,
    }

    impl RmcpTransport<RoleClient> for ChannelRmcpTransport {
        type Error = io::Error;

        fn send(
            &mut self,
            item: TxJsonRpcMessage<RoleClient>,
        ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send + 'static
        {
            let tx = self.outbound.clone();
            async move {
                tx.send(item)
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
            }
        }

        async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleClient>> {
            self.inbound.recv().await
        }

        fn close(
            &mut self,
        ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
            self.inbound.close();
            std::future::ready(Ok(()))
        }
    }

    fn reply(id: serde_json::Value, result: serde_json::Value) -> ServerJsonRpcMessage {
        serde_json::from_value(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .expect("scripted response should deserialize")
    }

    fn scripted_running_service(behavior: ScriptedServer) -> MCPRunningService {
        let (outbound_tx, mut outbound_rx) = unbounded_channel::<TxJsonRpcMessage<RoleClient>>();
        let (inbound_tx, inbound_rx) = unbounded_channel::<RxJsonRpcMessage<RoleClient>>();
        let transport = ChannelRmcpTransport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Ok(value) = serde_json::to_value(message) else {
                    continue;
                };
                let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
                    continue;
                };
                let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);

                match (&behavior, method) {
                    (ScriptedServer::DisconnectOnCallTool, "tools/call") => return,
                    (ScriptedServer::ListTools { tool_names }, "tools/list") => {
                        let tools: Vec<_> = tool_names
                            .iter()
                            .map(|name| {
                                json!({
                                    "name": name,
                                    "description": format!("{name} tool"),
                                    "inputSchema": { "type": "object", "properties": {} }
                                })
                            })
                            .collect();
                        let _ = inbound_tx.send(reply(id, json!({ "tools": tools })));
                    }
                    (ScriptedServer::CallTool { is_error }, "tools/call") => {
                        let result = if *is_error {
                            json!({
                                "content": [{ "type": "text", "text": "file not found" }],
                                "isError": true
                            })
                        } else {
                            json!({
                                "content": [{ "type": "text", "text": "tool ok" }],
                                "structuredContent": { "ok": true },
                                "isError": false
                            })
                        };
                        let _ = inbound_tx.send(reply(id, result));
                    }
                    _ => {}
                }
            }
        });

        serve_directly(().into_dyn(), transport, None)
    }

    struct ScriptedBootstrap {
        results: VecDeque<std::result::Result<MCPRunningService, ClientInitializeError>>,
        attempted: Arc<StdMutex<Vec<ProtocolVersion>>>,
    }

    impl ScriptedBootstrap {
        fn new(
            results: Vec<std::result::Result<MCPRunningService, ClientInitializeError>>,
        ) -> Self {
            Self {
                results: results.into(),
                attempted: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl MCPTransport for ScriptedBootstrap {
        async fn connect(
            &mut self,
            client_info: rmcp::model::ClientInfo,
        ) -> std::result::Result<MCPRunningService, ClientInitializeError> {
            self.attempted
                .lock()
                .expect("protocol mutex should lock")
                .push(client_info.protocol_version);
            self.results.pop_front().unwrap_or_else(|| {
                Err(ClientInitializeError::ConnectionClosed(
                    "no scripted result".into(),
                ))
            })
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    #[test]
    fn coerce_tool_arguments_accepts_object_and_stringified_object() {
        let from_obj = coerce_tool_arguments(json!({"path": "/tmp"}))
            .expect("object arguments should parse")
            .expect("object should be present");
        assert_eq!(from_obj.get("path"), Some(&json!("/tmp")));

        let from_str = coerce_tool_arguments(json!(r#"{"path":"/var"}"#))
            .expect("stringified object should parse")
            .expect("object should be present");
        assert_eq!(from_str.get("path"), Some(&json!("/var")));

        assert!(coerce_tool_arguments(json!(null))
            .expect("null is allowed")
            .is_none());
    }

    #[test]
    fn coerce_tool_arguments_rejects_non_object() {
        let err = coerce_tool_arguments(json!(["bad"])).expect_err("arrays should be rejected");
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[test]
    fn map_mcp_tool_schema_copies_fields() {
        let mut schema = serde_json::Map::new();
        schema.insert("type".into(), json!("object"));
        let tool = rmcp::model::Tool::new("read_file", "read a file", schema);

        let mapped = map_mcp_tool_schema(tool);
        assert_eq!(mapped.name, "read_file");
        assert_eq!(mapped.description.as_deref(), Some("read a file"));
        assert_eq!(mapped.input_schema["type"], "object");
    }

    #[test]
    fn service_errors_split_into_transport_and_remote() {
        assert!(matches!(
            map_service_error("echo", ServiceError::TransportClosed),
            BridgeError::Connection(_)
        ));
        assert!(matches!(
            map_service_error("echo", ServiceError::UnexpectedResponse),
            BridgeError::ToolExecution { .. }
        ));
        let cancelled = map_service_error(
            "echo",
            ServiceError::Cancelled {
                reason: Some("dropped".into()),
            },
        );
        assert!(cancelled.to_string().contains("dropped"));
    }

    #[tokio::test]
    async fn connect_uses_latest_protocol_first() {
        let mut transport = ScriptedBootstrap::new(vec![Ok(scripted_running_service(
            ScriptedServer::ListTools {
                tool_names: vec!["read_file".into()],
            },
        ))]);
        let attempted = Arc::clone(&transport.attempted);

        let session = McpSession::connect("fs", &mut transport)
            .await
            .expect("connect should succeed");

        assert_eq!(session.server_id(), "fs");
        let attempted = attempted.lock().expect("protocol mutex should lock");
        assert_eq!(attempted.as_slice(), &[ProtocolVersion::LATEST]);
    }

    #[tokio::test]
    async fn connect_falls_back_to_legacy_protocol_version() {
        let mut transport = ScriptedBootstrap::new(vec![
            Err(ClientInitializeError::JsonRpcError(
                rmcp::model::ErrorData::invalid_request("unsupported protocol version", None),
            )),
            Ok(scripted_running_service(ScriptedServer::ListTools {
                tool_names: vec!["read_file".into()],
            })),
        ]);
        let attempted = Arc::clone(&transport.attempted);

        McpSession::connect("fs", &mut transport)
            .await
            .expect("fallback handshake should succeed");

        let attempted = attempted.lock().expect("protocol mutex should lock");
        assert_eq!(
            attempted.as_slice(),
            &[ProtocolVersion::LATEST, ProtocolVersion::V_2024_11_05]
        );
    }

    #[tokio::test]
    async fn connect_reports_connection_error_without_fallback() {
        let mut transport = ScriptedBootstrap::new(vec![Err(
            ClientInitializeError::ConnectionClosed("eof".into()),
        )]);
        let err = McpSession::connect("fs", &mut transport)
            .await
            .err()
            .expect("closed handshake should fail");
        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(
            transport.attempted.lock().expect("protocol mutex").len(),
            1
        );
    }

    #[tokio::test]
    async fn list_tools_maps_every_tool() {
        let session = McpSession::from_running_service(
            "fs",
            scripted_running_service(ScriptedServer::ListTools {
                tool_names: vec!["read_file".into(), "write_file".into()],
            }),
        );

        let tools = session.list_tools().await.expect("list_tools");
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["read_file", "write_file"]);
        assert_eq!(tools[0].description.as_deref(), Some("read_file tool"));
    }

    #[tokio::test]
    async fn call_tool_prefers_structured_content() {
        let session = McpSession::from_running_service(
            "fs",
            scripted_running_service(ScriptedServer::CallTool { is_error: false }),
        );

        let output = session
            .call_tool_output("echo", json!({"message": "hello"}))
            .await
            .expect("call_tool should succeed");
        assert_eq!(output.text_content.as_deref(), Some("tool ok"));
        assert_eq!(output.into_value(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn call_tool_error_result_is_remote_failure() {
        let session = McpSession::from_running_service(
            "fs",
            scripted_running_service(ScriptedServer::CallTool { is_error: true }),
        );

        let err = session
            .call_tool("read_file", json!({"path": "/missing"}))
            .await
            .expect_err("isError result should fail");
        match err {
            BridgeError::ToolExecution { tool_name, message } => {
                assert_eq!(tool_name, "read_file");
                assert_eq!(message, "file not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn call_tool_on_dropped_transport_is_connection_error() {
        let session = McpSession::from_running_service(
            "fs",
            scripted_running_service(ScriptedServer::DisconnectOnCallTool),
        );

        let err = session
            .call_tool("echo", json!({}))
            .await
            .expect_err("dropped transport should fail");
        assert!(matches!(err, BridgeError::Connection(_)), "got {err}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = McpSession::from_running_service(
            "fs",
            scripted_running_service(ScriptedServer::ListTools { tool_names: vec![] }),
        );
        assert!(!session.is_closed().await);

        session.close().await.expect("first close");
        session.close().await.expect("second close");
        assert!(session.is_closed().await);
    }
}

//! Tool Invocation Gateway: one tool call against a connected server.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::connection::ConnectionRegistry;
use crate::error::{BridgeError, ErrorCategory, Result};
use crate::events::{DomainEvent, EventSink, EventType};
use crate::util::timeout;

/// Outcome of one tool call. Success and remote failure share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub execution_id: String,
    pub server: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
    /// Elapsed wall time in milliseconds.
    pub execution_time: u64,
    pub timestamp: DateTime<Utc>,
}

impl ToolExecution {
    fn new(execution_id: &str, server: &str, tool: &str, started: Instant) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            result: None,
            error: None,
            success: false,
            execution_time: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    fn succeeded(mut self, result: Value) -> Self {
        self.result = Some(result);
        self.success = true;
        self
    }

    fn failed(mut self, error: &BridgeError) -> Self {
        self.error = Some(error.to_string());
        self.success = false;
        self
    }

    fn event_type(&self) -> EventType {
        if self.success {
            EventType::ToolCompleted
        } else {
            EventType::ToolFailed
        }
    }
}

/// Runs tool calls and reports each one as a domain event.
#[derive(Clone)]
pub struct ToolGateway {
    registry: ConnectionRegistry,
    events: Arc<dyn EventSink>,
    default_timeout: Duration,
}

impl ToolGateway {
    pub fn new(
        registry: ConnectionRegistry,
        events: Arc<dyn EventSink>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            default_timeout,
        }
    }

    /// Execute `tool` on `server`, waiting at most `timeout`.
    ///
    /// Remote failures come back as `Ok` with `success == false`. Unknown or
    /// disconnected servers, unknown tools, malformed arguments, and timeouts
    /// are errors. Every path emits `tool_completed` or `tool_failed`.
    pub async fn execute_tool(
        &self,
        server: &str,
        tool: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolExecution> {
        let execution_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let timeout = timeout.unwrap_or(self.default_timeout);

        let lease = match self.registry.lease(server, tool).await {
            Ok(lease) => lease,
            Err(error) => {
                tracing::warn!(server, tool, error = %error, "Tool call rejected");
                let execution = ToolExecution::new(&execution_id, server, tool, started).failed(&error);
                self.emit(&execution, &parameters);
                return Err(error);
            }
        };

        tracing::debug!(server, tool, execution_id = %execution_id, "Executing tool");
        let outcome = timeout::race(timeout, lease.session.call_tool(tool, parameters.clone())).await;
        let execution = ToolExecution::new(&execution_id, server, tool, started);

        match outcome {
            None => {
                let error = BridgeError::ExecutionTimeout {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                tracing::warn!(server, tool, execution_id = %execution_id, "Tool execution timed out");
                self.emit(&execution.failed(&error), &parameters);
                Err(error)
            }
            Some(Ok(result)) => {
                let execution = execution.succeeded(result);
                tracing::info!(
                    server,
                    tool,
                    execution_id = %execution_id,
                    execution_time_ms = execution.execution_time,
                    "Tool executed"
                );
                self.emit(&execution, &parameters);
                Ok(execution)
            }
            Some(Err(error)) => {
                let execution = execution.failed(&error);
                tracing::warn!(
                    server,
                    tool,
                    execution_id = %execution_id,
                    error = %error,
                    "Tool execution failed"
                );
                self.emit(&execution, &parameters);

                match error.category() {
                    ErrorCategory::Input => Err(error),
                    ErrorCategory::Transport => {
                        self.registry.report_transport_error(&lease, &error).await;
                        Ok(execution)
                    }
                    _ => Ok(execution),
                }
            }
        }
    }

    fn emit(&self, execution: &ToolExecution, parameters: &Value) {
        let mut payload = match serde_json::to_value(execution) {
            Ok(Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(error) => {
                tracing::error!(error = %error, "Failed to serialize tool execution event");
                return;
            }
        };
        payload.insert(
            "request".into(),
            json!({
                "server": execution.server,
                "tool": execution.tool,
                "parameters": parameters,
            }),
        );
        self.events
            .publish(DomainEvent::new(execution.event_type(), payload));
    }
}

//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::mcp::{ServerConnector, ToolSchema, ToolSession};
use crate::webhook::{WebhookRequest, WebhookSender};

/// How a [`MockSession`] answers tool calls.
#[derive(Debug, Clone)]
pub(crate) enum CallBehavior {
    /// Echo the tool name and arguments back.
    Echo,
    /// Report a remote tool failure with this message.
    Fail(String),
    /// Never answer.
    Hang,
    /// Drop the transport mid-call.
    Disconnect,
}

pub(crate) struct MockSession {
    tools: Vec<ToolSchema>,
    behavior: CallBehavior,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    calls: AtomicUsize,
}

impl MockSession {
    pub(crate) fn new(tool_names: &[&str], behavior: CallBehavior) -> Arc<Self> {
        Arc::new(Self {
            tools: tool_names.iter().map(|name| ToolSchema::new(*name)).collect(),
            behavior,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn echo(tool_names: &[&str]) -> Arc<Self> {
        Self::new(tool_names, CallBehavior::Echo)
    }

    /// Simulate the server process going away.
    pub(crate) fn drop_transport(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            CallBehavior::Echo => Ok(json!({ "tool": name, "arguments": arguments })),
            CallBehavior::Fail(message) => Err(BridgeError::ToolExecution {
                tool_name: name.to_string(),
                message: message.clone(),
            }),
            CallBehavior::Hang => std::future::pending().await,
            CallBehavior::Disconnect => {
                self.drop_transport();
                Err(BridgeError::Connection(format!("{name}: transport closed")))
            }
        }
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands out scripted sessions, refusing once the script runs out.
#[derive(Default)]
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<Arc<MockSession>>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, session: Arc<MockSession>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(session);
        }
    }

    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn ToolSession>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(Instant::now());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(session) => Ok(session as Arc<dyn ToolSession>),
            None => Err(BridgeError::Connection(format!(
                "{}: connection refused",
                config.id
            ))),
        }
    }
}

pub(crate) fn stdio_config(id: &str) -> ServerConfig {
    ServerConfig::stdio(id, format!("{id} server"), "mcp-server", vec!["--stdio".into()])
}

/// Webhook sender that records every attempt and can be told to fail.
#[derive(Default)]
pub(crate) struct RecordingSender {
    attempts: Mutex<Vec<(Instant, WebhookRequest)>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<WebhookRequest> {
        self.attempts
            .lock()
            .map(|a| a.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn times(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .map(|a| a.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WebhookSender for RecordingSender {
    async fn send(&self, request: &WebhookRequest) -> Result<()> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push((Instant::now(), request.clone()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::delivery_status(500, "Internal Server Error"));
        }
        Ok(())
    }
}

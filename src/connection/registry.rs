use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{ConnectionState, ReconnectPolicy};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::events::{DomainEvent, EventSink, EventType};
use crate::mcp::{ServerConnector, ToolDescriptor, ToolSchema, ToolSession};

/// Read-only copy of one connection's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub tool_count: usize,
    pub tools: Vec<ToolDescriptor>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// A live session handed to the gateway for one call.
pub(crate) struct Lease {
    pub(crate) server_id: String,
    pub(crate) session: Arc<dyn ToolSession>,
    epoch: u64,
}

struct Entry {
    config: ServerConfig,
    state: ConnectionState,
    session: Option<Arc<dyn ToolSession>>,
    tools: Vec<ToolDescriptor>,
    last_connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: u32,
    /// Bumped whenever an attempt starts or the entry is torn down, so
    /// callbacks from older attempts can tell they are stale.
    epoch: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Entry {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            session: None,
            tools: Vec::new(),
            last_connected_at: None,
            last_error: None,
            retry_count: 0,
            epoch: 0,
            reconnect_timer: None,
            monitor: None,
        }
    }

    fn begin_attempt(&mut self) -> (ServerConfig, u64) {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        (self.config.clone(), self.epoch)
    }

    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    fn take_session(&mut self) -> Option<Arc<dyn ToolSession>> {
        self.tools.clear();
        self.session.take()
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            transport: self.config.transport.kind().to_string(),
            state: self.state,
            connected: self.state.is_connected(),
            tool_count: self.tools.len(),
            tools: self.tools.clone(),
            last_connected_at: self.last_connected_at,
            last_error: self.last_error.clone(),
            retry_count: self.retry_count,
        }
    }
}

struct Inner {
    connector: Arc<dyn ServerConnector>,
    events: Arc<dyn EventSink>,
    policy: ReconnectPolicy,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

/// Owns every upstream connection and its recovery timers.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn ServerConnector>,
        events: Arc<dyn EventSink>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                events,
                policy,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register `config` and try to connect.
    ///
    /// Only an invalid config is an error. A failed attempt leaves the entry
    /// `Failed` with a reconnect scheduled.
    pub async fn connect(&self, config: ServerConfig) -> Result<ConnectionSnapshot> {
        config.validate()?;
        let id = config.id.clone();

        let entry = {
            let mut entries = self.inner.entries.write().await;
            Arc::clone(
                entries
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Entry::new(config.clone())))),
            )
        };

        let (config, epoch, previous) = {
            let mut guard = entry.lock().await;
            guard.config = config;
            guard.cancel_tasks();
            guard.retry_count = 0;
            let previous = guard.take_session();
            let (config, epoch) = guard.begin_attempt();
            (config, epoch, previous)
        };
        close_quietly(&id, previous).await;

        tracing::info!(server = %id, transport = config.transport.kind(), "Connecting to MCP server");
        self.inner.run_attempt(&id, &entry, config, epoch).await;
        let snapshot = entry.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Operator-requested reconnect. Resets the retry budget.
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionSnapshot> {
        let entry = self
            .inner
            .entry(id)
            .await
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;

        let (config, epoch, previous) = {
            let mut guard = entry.lock().await;
            guard.cancel_tasks();
            guard.retry_count = 0;
            let previous = guard.take_session();
            let (config, epoch) = guard.begin_attempt();
            (config, epoch, previous)
        };
        close_quietly(id, previous).await;

        tracing::info!(server = %id, "Reconnecting MCP server on request");
        self.inner.run_attempt(id, &entry, config, epoch).await;
        let snapshot = entry.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Cancel timers, close the session, and forget the entry.
    ///
    /// Returns `false` when `id` was not registered.
    pub async fn disconnect(&self, id: &str) -> bool {
        let Some(entry) = self.inner.entries.write().await.remove(id) else {
            tracing::debug!(server = %id, "Disconnect for unknown server ignored");
            return false;
        };

        let session = {
            let mut guard = entry.lock().await;
            guard.epoch += 1;
            guard.cancel_tasks();
            guard.state = ConnectionState::Disconnected;
            guard.take_session()
        };
        close_quietly(id, session).await;

        tracing::info!(server = %id, "Disconnected from MCP server");
        self.inner
            .events
            .publish(DomainEvent::server(EventType::ServerDisconnected, id, None));
        true
    }

    /// Disconnect everything. Returns how many connections were closed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.inner.entries.read().await.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.disconnect(&id).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn get_connection(&self, id: &str) -> Option<ConnectionSnapshot> {
        let entry = self.inner.entry(id).await?;
        let snapshot = entry.lock().await.snapshot();
        Some(snapshot)
    }

    /// Snapshots of every registered connection, ordered by id.
    pub async fn list_connections(&self) -> Vec<ConnectionSnapshot> {
        let entries: Vec<_> = self.inner.entries.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Tools discovered on one connection.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>> {
        self.get_connection(id)
            .await
            .map(|snapshot| snapshot.tools)
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))
    }

    /// Tools across every connected server.
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        self.list_connections()
            .await
            .into_iter()
            .filter(|snapshot| snapshot.connected)
            .flat_map(|snapshot| snapshot.tools)
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.list_connections()
            .await
            .iter()
            .filter(|snapshot| snapshot.connected)
            .count()
    }

    /// Resolve a connected session offering `tool`.
    pub(crate) async fn lease(&self, id: &str, tool: &str) -> Result<Lease> {
        let entry = self
            .inner
            .entry(id)
            .await
            .ok_or_else(|| BridgeError::ServerNotConnected(id.to_string()))?;
        let guard = entry.lock().await;

        let session = match (&guard.state, &guard.session) {
            (ConnectionState::Connected, Some(session)) => Arc::clone(session),
            _ => return Err(BridgeError::ServerNotConnected(id.to_string())),
        };
        if !guard.tools.iter().any(|descriptor| descriptor.name == tool) {
            return Err(BridgeError::ToolNotFound {
                server: id.to_string(),
                tool: tool.to_string(),
            });
        }

        Ok(Lease {
            server_id: id.to_string(),
            session,
            epoch: guard.epoch,
        })
    }

    /// Feed a transport-level call failure back into the state machine.
    pub(crate) async fn report_transport_error(&self, lease: &Lease, error: &BridgeError) {
        if !lease.session.is_closed().await {
            return;
        }
        self.inner
            .transport_lost(&lease.server_id, lease.epoch, error.to_string(), true)
            .await;
    }
}

impl Inner {
    async fn entry(&self, id: &str) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().await.get(id).cloned()
    }

    async fn open(&self, config: &ServerConfig) -> Result<(Arc<dyn ToolSession>, Vec<ToolSchema>)> {
        let session = self.connector.connect(config).await?;
        match session.list_tools().await {
            Ok(tools) => Ok((session, tools)),
            Err(error) => {
                close_quietly(&config.id, Some(session)).await;
                Err(error)
            }
        }
    }

    async fn run_attempt(
        self: &Arc<Self>,
        id: &str,
        entry: &Arc<Mutex<Entry>>,
        config: ServerConfig,
        epoch: u64,
    ) {
        let outcome = self.open(&config).await;

        let mut guard = entry.lock().await;
        if guard.epoch != epoch {
            drop(guard);
            tracing::debug!(server = %id, "Discarding superseded connection attempt");
            if let Ok((session, _)) = outcome {
                close_quietly(id, Some(session)).await;
            }
            return;
        }

        match outcome {
            Ok((session, tools)) => {
                let mut descriptors: Vec<ToolDescriptor> = Vec::with_capacity(tools.len());
                for tool in tools {
                    if descriptors.iter().any(|d| d.name == tool.name) {
                        tracing::warn!(server = %id, tool = %tool.name, "Duplicate tool name ignored");
                        continue;
                    }
                    descriptors.push(ToolDescriptor::from_schema(id, tool));
                }

                guard.state = ConnectionState::Connected;
                guard.tools = descriptors;
                guard.last_connected_at = Some(Utc::now());
                guard.last_error = None;
                guard.retry_count = 0;
                guard.monitor = Some(self.spawn_monitor(id, epoch, Arc::clone(&session)));
                guard.session = Some(session);

                tracing::info!(server = %id, tool_count = guard.tools.len(), "Connected to MCP server");
                self.events
                    .publish(DomainEvent::server(EventType::ServerConnected, id, None));
            }
            Err(error) => {
                guard.state = ConnectionState::Failed;
                guard.last_error = Some(error.to_string());
                tracing::warn!(server = %id, error = %error, "Failed to connect to MCP server");
                self.schedule_reconnect(id, &mut guard);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, id: &str, entry: &mut Entry) {
        if let Some(timer) = entry.reconnect_timer.take() {
            timer.abort();
        }
        if entry.retry_count >= self.policy.max_retries {
            tracing::error!(
                server = %id,
                retries = entry.retry_count,
                "Max reconnection attempts reached, giving up"
            );
            return;
        }

        entry.retry_count += 1;
        let delay = self.policy.delay_for(entry.retry_count);
        tracing::info!(
            server = %id,
            attempt = entry.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = id.to_string();
        let epoch = entry.epoch;
        entry.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_reconnect_timer(&id, epoch).await;
            }
        }));
    }

    async fn on_reconnect_timer(self: &Arc<Self>, id: &str, epoch: u64) {
        let Some(entry) = self.entry(id).await else {
            return;
        };
        let (config, epoch) = {
            let mut guard = entry.lock().await;
            if guard.epoch != epoch || guard.state != ConnectionState::Failed {
                return;
            }
            // This task is the timer; detach rather than abort it.
            guard.reconnect_timer.take();
            guard.begin_attempt()
        };
        tracing::info!(server = %id, "Attempting reconnect");
        self.run_attempt(id, &entry, config, epoch).await;
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        id: &str,
        epoch: u64,
        session: Arc<dyn ToolSession>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.policy.health_check_interval;
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !session.is_closed().await {
                    continue;
                }
                if let Some(inner) = weak.upgrade() {
                    inner
                        .transport_lost(&id, epoch, "transport closed".into(), false)
                        .await;
                }
                return;
            }
        })
    }

    /// `Connected -> Failed`, then the same backoff path as a failed connect.
    async fn transport_lost(
        self: &Arc<Self>,
        id: &str,
        epoch: u64,
        reason: String,
        abort_monitor: bool,
    ) {
        let Some(entry) = self.entry(id).await else {
            return;
        };
        let session = {
            let mut guard = entry.lock().await;
            if guard.epoch != epoch || guard.state != ConnectionState::Connected {
                return;
            }
            let monitor = guard.monitor.take();
            if abort_monitor {
                if let Some(monitor) = monitor {
                    monitor.abort();
                }
            }
            guard.state = ConnectionState::Failed;
            guard.last_error = Some(reason.clone());
            let session = guard.take_session();

            tracing::warn!(server = %id, error = %reason, "MCP server connection lost");
            self.events.publish(DomainEvent::server(
                EventType::ServerDisconnected,
                id,
                Some(&reason),
            ));
            self.schedule_reconnect(id, &mut guard);
            session
        };
        close_quietly(id, session).await;
    }
}

async fn close_quietly(id: &str, session: Option<Arc<dyn ToolSession>>) {
    if let Some(session) = session {
        if let Err(error) = session.close().await {
            tracing::debug!(server = %id, error = %error, "Error closing MCP session");
        }
    }
}

//! Configuration system (layered: code > env > `.env` file).
//!
//! Server definitions come from a separate list file so operators can keep
//! them under version control; everything else is tunable through
//! environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::connection::ReconnectPolicy;
use crate::error::{BridgeError, Result};
use crate::webhook::DeliveryPolicy;

const DEFAULT_SERVERS_PATH: &str = "/etc/mcp/servers.json";

/// How to reach one upstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a child process and speak JSON-RPC over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default, rename = "authToken", skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
}

impl TransportConfig {
    /// Short label used in logs and snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

/// One upstream server record as supplied by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Stdio server config.
    pub fn stdio(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
        }
    }

    /// Streamable HTTP server config.
    pub fn http(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            transport: TransportConfig::Http {
                url: url.into(),
                auth_token: None,
            },
        }
    }

    /// Reject records that could never connect.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::Validation("server id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(BridgeError::Validation(format!(
                "server '{}' must have a name",
                self.id
            )));
        }
        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                Err(BridgeError::Validation(format!(
                    "stdio server '{}' requires a command",
                    self.id
                )))
            }
            TransportConfig::Stdio { .. } => Ok(()),
            TransportConfig::Http { url, .. } => {
                let parsed = Url::parse(url).map_err(|e| {
                    BridgeError::Validation(format!("server '{}' has invalid url: {e}", self.id))
                })?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(BridgeError::Validation(format!(
                        "server '{}' url scheme must be http or https, got {other}",
                        self.id
                    ))),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// Read the server list file.
///
/// A missing file yields an empty list. `.toml` files are parsed as TOML,
/// anything else as JSON.
pub fn load_server_configs(path: &Path) -> Result<Vec<ServerConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No server config found, starting with none");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let list: ServerList = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| {
            BridgeError::Configuration(format!("invalid server list {}: {e}", path.display()))
        })?,
        _ => serde_json::from_str(&raw).map_err(|e| {
            BridgeError::Configuration(format!("invalid server list {}: {e}", path.display()))
        })?,
    };

    for server in &list.servers {
        server
            .validate()
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;
    }
    Ok(list.servers)
}

/// Which key-value backend holds webhook subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    /// One JSON file per key inside this directory.
    File(PathBuf),
    /// `redis://` connection URL.
    Redis(String),
}

impl StoreConfig {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "memory" {
            return Ok(Self::Memory);
        }
        if let Some(dir) = raw.strip_prefix("file:") {
            if dir.is_empty() {
                return Err(BridgeError::Configuration(
                    "file store requires a directory".into(),
                ));
            }
            return Ok(Self::File(PathBuf::from(dir)));
        }
        if raw.starts_with("redis://") || raw.starts_with("rediss://") {
            return Ok(Self::Redis(raw.to_string()));
        }
        Err(BridgeError::Configuration(format!(
            "unsupported store '{raw}' (expected memory, file:<dir>, or redis://)"
        )))
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub servers_path: PathBuf,
    pub store: StoreConfig,
    /// Default tool timeout when a request does not set one.
    pub tool_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub delivery: DeliveryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            servers_path: PathBuf::from(DEFAULT_SERVERS_PATH),
            store: StoreConfig::Memory,
            tool_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from environment variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("MCP_CONFIG_PATH") {
            config.servers_path = PathBuf::from(path);
        }
        if let Some(store) = lookup("MCP_BRIDGE_STORE") {
            config.store = StoreConfig::parse(&store)?;
        }
        if let Some(ms) = parse_u64(&lookup, "MCP_TOOL_TIMEOUT_MS")? {
            config.tool_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parse_u64(&lookup, "MCP_RECONNECT_MAX_RETRIES")? {
            config.reconnect.max_retries = to_u32("MCP_RECONNECT_MAX_RETRIES", n)?;
        }
        if let Some(ms) = parse_u64(&lookup, "MCP_RECONNECT_BASE_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "MCP_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "MCP_HEALTH_CHECK_MS")? {
            if ms == 0 {
                return Err(BridgeError::Configuration(
                    "MCP_HEALTH_CHECK_MS must be greater than zero".into(),
                ));
            }
            config.reconnect.health_check_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_u64(&lookup, "WEBHOOK_TIMEOUT_MS")? {
            config.delivery.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_u64(&lookup, "WEBHOOK_MAX_ATTEMPTS")? {
            config.delivery.retry.max_attempts = to_u32("WEBHOOK_MAX_ATTEMPTS", n)?.max(1);
        }
        if let Some(ms) = parse_u64(&lookup, "WEBHOOK_RETRY_BASE_MS")? {
            config.delivery.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = parse_u64(&lookup, "WEBHOOK_DISABLE_THRESHOLD")? {
            config.delivery.disable_threshold = to_u32("WEBHOOK_DISABLE_THRESHOLD", n)?.max(1);
        }

        Ok(config)
    }

    /// Load the configured server list.
    pub fn load_servers(&self) -> Result<Vec<ServerConfig>> {
        load_server_configs(&self.servers_path)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| BridgeError::Configuration(format!("{key}='{raw}': {e}"))),
    }
}

fn to_u32(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| BridgeError::Configuration(format!("{key}={value} is out of range")))
}

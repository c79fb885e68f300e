//! Error types for the bridge.

use thiserror::Error;

/// Broad error category used for routing and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied something malformed.
    Input,
    /// A referenced server, tool, or subscription does not exist.
    NotFound,
    /// A server exists but has no live session.
    Unavailable,
    Timeout,
    /// The upstream tool ran and reported failure.
    Remote,
    Transport,
    Delivery,
    Storage,
    Configuration,
    Serialization,
}

/// Primary error type for all bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server {0} is not connected")]
    ServerNotConnected(String),

    #[error("Tool {tool} not found on server {server}")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool {tool} on server {server} timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Webhook delivery failed: {message}")]
    Delivery {
        status: Option<u16>,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Webhook not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Create a delivery error from a non-success HTTP status.
    pub fn delivery_status(status: u16, reason: impl Into<String>) -> Self {
        Self::Delivery {
            status: Some(status),
            message: format!("webhook returned {status}: {}", reason.into()),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::InvalidArgument(_) => ErrorCategory::Input,
            Self::ServerNotFound(_) | Self::ToolNotFound { .. } | Self::SubscriptionNotFound(_) => {
                ErrorCategory::NotFound
            }
            Self::ServerNotConnected(_) => ErrorCategory::Unavailable,
            Self::ExecutionTimeout { .. } => ErrorCategory::Timeout,
            Self::ToolExecution { .. } => ErrorCategory::Remote,
            Self::Connection(_) | Self::Io(_) => ErrorCategory::Transport,
            Self::Delivery { .. } | Self::Network(_) => ErrorCategory::Delivery,
            Self::Store(_) => ErrorCategory::Storage,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
        }
    }

    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Delivery | ErrorCategory::Timeout
        )
    }

    /// HTTP status the API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::Input => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Unavailable => 409,
            ErrorCategory::Timeout => 504,
            ErrorCategory::Remote | ErrorCategory::Transport | ErrorCategory::Delivery => 502,
            ErrorCategory::Storage | ErrorCategory::Configuration | ErrorCategory::Serialization => {
                500
            }
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BridgeError>;

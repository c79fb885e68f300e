//! MCP transport layer.

use async_trait::async_trait;
use rmcp::model::ClientInfo;
use rmcp::service::{ClientInitializeError, DynService, RoleClient, RunningService};

use crate::config::TransportConfig;

pub type DynClientService = Box<dyn DynService<RoleClient>>;
pub type MCPRunningService = RunningService<RoleClient, DynClientService>;

/// Transport trait for MCP communication.
#[async_trait]
pub trait MCPTransport: Send {
    /// Create and initialize a new rmcp running service for this transport.
    async fn connect(
        &mut self,
        client_info: ClientInfo,
    ) -> Result<MCPRunningService, ClientInitializeError>;

    /// Short label used in logs.
    fn kind(&self) -> &'static str;
}

mod http;
mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Build the transport described by a server's configuration.
pub fn transport_for(config: &TransportConfig) -> Box<dyn MCPTransport> {
    match config {
        TransportConfig::Stdio { command, args, env } => Box::new(
            StdioTransport::new(command.clone(), args.clone()).with_env(env.clone()),
        ),
        TransportConfig::Http { url, auth_token } => {
            let transport = HttpTransport::new(url.clone());
            match auth_token {
                Some(token) => Box::new(transport.with_auth_token(token.clone())),
                None => Box::new(transport),
            }
        }
    }
}

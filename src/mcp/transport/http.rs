use async_trait::async_trait;
use rmcp::model::ClientInfo;
use rmcp::service::{ClientInitializeError, ServiceExt};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;

use super::{MCPRunningService, MCPTransport};

/// Streamable HTTP MCP transport (for remote MCP servers).
pub struct HttpTransport {
    url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
        }
    }

    /// Bearer token sent with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MCPTransport for HttpTransport {
    async fn connect(
        &mut self,
        client_info: ClientInfo,
    ) -> Result<MCPRunningService, ClientInitializeError> {
        let transport = match &self.auth_token {
            Some(token) => {
                let mut config = StreamableHttpClientTransportConfig::with_uri(self.url.as_str());
                config.auth_header = Some(token.clone());
                StreamableHttpClientTransport::from_config(config)
            }
            None => StreamableHttpClientTransport::from_uri(self.url.as_str()),
        };

        client_info.into_dyn().serve(transport).await
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

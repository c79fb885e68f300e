//! Outbound webhook POSTs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::{BridgeError, Result};

pub const EVENT_HEADER: &str = "X-MCP-Bridge-Event";
pub const WEBHOOK_ID_HEADER: &str = "X-MCP-Bridge-Webhook-ID";

/// One outbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    /// Sent as the event header.
    pub event: String,
    pub subscription_id: String,
    pub body: Value,
}

/// Performs a single delivery attempt. Retries are the caller's job.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, request: &WebhookRequest) -> Result<()>;
}

/// reqwest-backed sender.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mcp-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, request: &WebhookRequest) -> Result<()> {
        let response = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, &request.event)
            .header(WEBHOOK_ID_HEADER, &request.subscription_id)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = status.canonical_reason().unwrap_or("unexpected status");
        Err(BridgeError::delivery_status(status.as_u16(), reason))
    }
}

//! Webhook subscription records and filter matching.

use std::str::FromStr;

use bon::Builder;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};
use crate::events::EventType;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5_000;

/// How matched events reach the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One POST per event.
    #[default]
    Immediate,
    /// Aggregate until `batch_size` events or `batch_timeout_ms` elapse.
    Batched {
        #[serde(rename = "batchSize")]
        batch_size: usize,
        #[serde(rename = "batchTimeoutMs")]
        batch_timeout_ms: u64,
    },
}

/// Delivery options as accepted on create/update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOptions {
    #[serde(default)]
    pub batch_events: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout: Option<u64>,
}

impl WebhookOptions {
    pub fn delivery_mode(&self) -> Result<DeliveryMode> {
        if !self.batch_events {
            return Ok(DeliveryMode::Immediate);
        }
        let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_timeout_ms = self.batch_timeout.unwrap_or(DEFAULT_BATCH_TIMEOUT_MS);
        if batch_size == 0 {
            return Err(BridgeError::Validation("batchSize must be at least 1".into()));
        }
        if batch_timeout_ms == 0 {
            return Err(BridgeError::Validation(
                "batchTimeout must be greater than zero".into(),
            ));
        }
        Ok(DeliveryMode::Batched {
            batch_size,
            batch_timeout_ms,
        })
    }
}

/// A registered webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub url: String,
    pub event: EventType,
    /// Field name to required value. Empty matches everything.
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub delivery: DeliveryMode,
    pub active: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Active, same event type, and the payload satisfies every filter entry.
    pub fn accepts(&self, event_type: EventType, payload: &Map<String, Value>) -> bool {
        self.active && self.event == event_type && matches_filter(&self.filters, payload)
    }
}

/// AND of exact-equality checks; a missing field rejects.
pub fn matches_filter(filters: &Map<String, Value>, payload: &Map<String, Value>) -> bool {
    filters
        .iter()
        .all(|(key, expected)| payload.get(key) == Some(expected))
}

/// Create request.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    #[builder(into)]
    pub url: String,
    #[builder(into)]
    pub event: String,
    #[serde(default)]
    #[builder(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    #[builder(default)]
    pub options: WebhookOptions,
    #[serde(default)]
    pub active: Option<bool>,
}

impl NewSubscription {
    /// Check the definition and produce the record to store.
    pub(crate) fn into_subscription(self, id: String) -> Result<Subscription> {
        validate_url(&self.url)?;
        let event = parse_event(&self.event)?;
        let delivery = self.options.delivery_mode()?;
        Ok(Subscription {
            id,
            url: self.url,
            event,
            filters: self.filters,
            delivery,
            active: self.active.unwrap_or(true),
            failure_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        })
    }
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    pub url: Option<String>,
    pub event: Option<String>,
    pub filters: Option<Map<String, Value>>,
    pub options: Option<WebhookOptions>,
    pub active: Option<bool>,
}

impl SubscriptionUpdate {
    /// Merge into `current`, validating every supplied field first.
    pub(crate) fn apply(self, current: &Subscription) -> Result<Subscription> {
        let mut next = current.clone();
        if let Some(url) = self.url {
            validate_url(&url)?;
            next.url = url;
        }
        if let Some(event) = self.event {
            next.event = parse_event(&event)?;
        }
        if let Some(filters) = self.filters {
            next.filters = filters;
        }
        if let Some(options) = self.options {
            next.delivery = options.delivery_mode()?;
        }
        if let Some(active) = self.active {
            // Reactivation starts a fresh failure run.
            if active && !current.active {
                next.failure_count = 0;
            }
            next.active = active;
        }
        Ok(next)
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url =
        Url::parse(raw).map_err(|e| BridgeError::Validation(format!("invalid webhook url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(BridgeError::Validation(format!(
            "webhook url scheme must be http or https, got {other}"
        ))),
    }
}

fn parse_event(raw: &str) -> Result<EventType> {
    EventType::from_str(raw)
        .map_err(|_| BridgeError::Validation(format!("unsupported event type '{raw}'")))
}

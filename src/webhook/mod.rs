//! Webhook subscriptions and event delivery.

mod batch;
mod dispatcher;
mod registry;
mod sender;
mod store;
mod subscription;

use std::time::Duration;

use crate::util::retry::RetryPolicy;

pub use dispatcher::EventDispatcher;
pub use registry::SubscriptionRegistry;
pub use sender::{
    HttpWebhookSender, WebhookRequest, WebhookSender, EVENT_HEADER, WEBHOOK_ID_HEADER,
};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{open_store, FileStore, KeyValueStore, MemoryStore};
pub use subscription::{
    matches_filter, DeliveryMode, NewSubscription, Subscription, SubscriptionUpdate,
    WebhookOptions,
};

/// Retry and circuit-breaking settings for outbound deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPolicy {
    /// Attempts per delivery and the backoff between them.
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Consecutive failed deliveries before a subscription is disabled.
    pub disable_threshold: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            disable_threshold: 10,
        }
    }
}

//! Event Dispatcher: match events to subscriptions and deliver them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;

use super::batch::BatchQueue;
use super::registry::SubscriptionRegistry;
use super::sender::{WebhookRequest, WebhookSender};
use super::subscription::{DeliveryMode, Subscription};
use super::DeliveryPolicy;
use crate::error::Result;
use crate::events::{DomainEvent, EventSink, EventType};

struct Inner {
    subscriptions: Arc<SubscriptionRegistry>,
    sender: Arc<dyn WebhookSender>,
    policy: DeliveryPolicy,
    batches: RwLock<HashMap<String, Arc<Mutex<BatchQueue>>>>,
    tasks: TaskTracker,
    /// Set by shutdown; batches flush on enqueue instead of arming a timer.
    closing: AtomicBool,
}

/// Fans domain events out to matching webhooks.
///
/// Subscribers are looked up at publish time; nothing registers callbacks.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        sender: Arc<dyn WebhookSender>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions,
                sender,
                policy,
                batches: RwLock::new(HashMap::new()),
                tasks: TaskTracker::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.subscriptions
    }

    /// Deliver or enqueue `payload` for every matching subscription.
    ///
    /// Resolves once immediate deliveries (including retries) and any
    /// size-triggered flushes finish. Returns the number of matches.
    pub async fn trigger_event(&self, event_type: EventType, payload: Map<String, Value>) -> usize {
        self.dispatch_event(DomainEvent::new(event_type, payload)).await
    }

    /// Like [`trigger_event`](Self::trigger_event), stamping the envelope
    /// with the time the event was produced.
    pub async fn dispatch_event(&self, event: DomainEvent) -> usize {
        let DomainEvent {
            event_type,
            payload,
            timestamp,
        } = event;
        let matched = self.inner.subscriptions.matching(event_type, &payload).await;
        if matched.is_empty() {
            tracing::trace!(event = %event_type, "No webhooks for event");
            return 0;
        }

        let count = matched.len();
        tracing::debug!(event = %event_type, matched = count, "Dispatching event");
        let envelope = json!({
            "event": event_type,
            "data": payload,
            "timestamp": timestamp.to_rfc3339(),
        });
        join_all(
            matched
                .into_iter()
                .map(|subscription| self.inner.dispatch(subscription, envelope.clone())),
        )
        .await;
        count
    }

    /// Send a synthetic event of the subscription's own type.
    pub async fn test_subscription(&self, id: &str) -> Result<usize> {
        let subscription = self.inner.subscriptions.get(id).await?;
        let mut payload = Map::new();
        payload.insert("test".into(), Value::Bool(true));
        payload.insert("webhookId".into(), Value::String(id.to_string()));
        payload.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        Ok(self.trigger_event(subscription.event, payload).await)
    }

    /// Delete a subscription and discard its pending batch and timer.
    pub async fn remove_subscription(&self, id: &str) -> Result<()> {
        self.inner.subscriptions.delete(id).await?;
        self.inner.discard_batch(id).await;
        Ok(())
    }

    /// Events waiting in a subscription's batch.
    pub async fn pending(&self, id: &str) -> usize {
        let queue = self.inner.batches.read().await.get(id).cloned();
        match queue {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    /// Flush every pending batch and wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.tasks.close();

        let queues: Vec<(String, Arc<Mutex<BatchQueue>>)> = self
            .inner
            .batches
            .read()
            .await
            .iter()
            .map(|(id, queue)| (id.clone(), Arc::clone(queue)))
            .collect();

        let inner = &self.inner;
        let mut flushes = Vec::new();
        for (id, queue) in queues {
            let events = queue.lock().await.drain();
            if !events.is_empty() {
                flushes.push(async move { inner.flush(&id, events).await });
            }
        }
        let flushed = flushes.len();
        join_all(flushes).await;

        self.inner.tasks.wait().await;
        tracing::info!(flushed_batches = flushed, "Event dispatcher stopped");
    }
}

impl EventSink for EventDispatcher {
    fn publish(&self, event: DomainEvent) {
        let dispatcher = self.clone();
        self.inner.tasks.spawn(async move {
            dispatcher.dispatch_event(event).await;
        });
    }
}

impl Inner {
    async fn dispatch(self: &Arc<Self>, subscription: Subscription, envelope: Value) {
        match subscription.delivery {
            DeliveryMode::Immediate => {
                self.deliver(&subscription, envelope).await;
            }
            DeliveryMode::Batched {
                batch_size,
                batch_timeout_ms,
            } => {
                self.enqueue(
                    &subscription.id,
                    envelope,
                    batch_size,
                    Duration::from_millis(batch_timeout_ms),
                )
                .await;
            }
        }
    }

    async fn enqueue(
        self: &Arc<Self>,
        id: &str,
        envelope: Value,
        batch_size: usize,
        batch_timeout: Duration,
    ) {
        let queue = {
            let mut batches = self.batches.write().await;
            Arc::clone(batches.entry(id.to_string()).or_default())
        };

        let ready = {
            let mut queue = queue.lock().await;
            if queue.push(envelope) >= batch_size {
                tracing::debug!(subscription_id = %id, "Batch size reached");
                Some(queue.drain())
            } else if self.closing.load(Ordering::SeqCst) {
                tracing::debug!(subscription_id = %id, "Flushing batch during shutdown");
                Some(queue.drain())
            } else {
                let weak = Arc::downgrade(self);
                let owned_id = id.to_string();
                queue.arm(|generation| {
                    self.tasks.spawn(async move {
                        tokio::time::sleep(batch_timeout).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.flush_on_timer(&owned_id, generation).await;
                        }
                    })
                });
                None
            }
        };

        if let Some(events) = ready {
            self.flush(id, events).await;
        }
    }

    async fn flush_on_timer(&self, id: &str, generation: u64) {
        let Some(queue) = self.batches.read().await.get(id).cloned() else {
            return;
        };
        let events = queue.lock().await.take_for_timer(generation);
        if let Some(events) = events {
            tracing::debug!(subscription_id = %id, "Batch timeout reached");
            self.flush(id, events).await;
        }
    }

    async fn flush(&self, id: &str, events: Vec<Value>) {
        if events.is_empty() {
            return;
        }
        let subscription = match self.subscriptions.get(id).await {
            Ok(subscription) if subscription.active => subscription,
            Ok(_) => {
                tracing::debug!(subscription_id = %id, "Dropping batch for inactive webhook");
                return;
            }
            Err(_) => {
                tracing::debug!(subscription_id = %id, "Dropping batch for removed webhook");
                self.discard_batch(id).await;
                return;
            }
        };

        let count = events.len();
        tracing::info!(subscription_id = %id, count, "Flushing webhook batch");
        let body = json!({
            "event": "batch",
            "batch": true,
            "events": events,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.deliver(&subscription, body).await;
    }

    async fn discard_batch(&self, id: &str) {
        let removed = self.batches.write().await.remove(id);
        if let Some(queue) = removed {
            let discarded = queue.lock().await.drain();
            if !discarded.is_empty() {
                tracing::debug!(
                    subscription_id = %id,
                    discarded = discarded.len(),
                    "Discarded pending batch"
                );
            }
        }
    }

    /// POST with retries, then fold the outcome into the subscription.
    async fn deliver(&self, subscription: &Subscription, body: Value) -> bool {
        let request = WebhookRequest {
            url: subscription.url.clone(),
            event: subscription.event.to_string(),
            subscription_id: subscription.id.clone(),
            body,
        };
        let sender: &dyn WebhookSender = self.sender.as_ref();
        let request_ref = &request;
        let outcome = self
            .policy
            .retry
            .execute(move |_attempt| sender.send(request_ref))
            .await;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    url = %subscription.url,
                    "Webhook delivered"
                );
                if let Err(error) = self.subscriptions.record_success(&subscription.id).await {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        error = %error,
                        "Failed to persist webhook state"
                    );
                }
                true
            }
            Err(error) => {
                match self
                    .subscriptions
                    .record_failure(&subscription.id, self.policy.disable_threshold)
                    .await
                {
                    Ok(Some(updated)) => tracing::error!(
                        subscription_id = %subscription.id,
                        url = %subscription.url,
                        error = %error,
                        failure_count = updated.failure_count,
                        "Webhook delivery failed"
                    ),
                    Ok(None) => tracing::debug!(
                        subscription_id = %subscription.id,
                        "Delivery failed for a webhook deleted meanwhile"
                    ),
                    Err(store_error) => tracing::error!(
                        subscription_id = %subscription.id,
                        error = %store_error,
                        "Failed to persist webhook state"
                    ),
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::testing::RecordingSender;
    use crate::webhook::{KeyValueStore, MemoryStore, NewSubscription, SubscriptionUpdate, WebhookOptions};
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn setup() -> (EventDispatcher, Arc<RecordingSender>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(store));
        let sender = RecordingSender::new();
        let dispatcher = EventDispatcher::new(
            registry,
            Arc::clone(&sender) as Arc<dyn WebhookSender>,
            DeliveryPolicy::default(),
        );
        (dispatcher, sender)
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn subscribe(
        dispatcher: &EventDispatcher,
        event: &str,
        filters: Value,
        options: WebhookOptions,
    ) -> Subscription {
        dispatcher
            .subscriptions()
            .create(
                NewSubscription::builder()
                    .url("https://hooks.example.com/in")
                    .event(event)
                    .filters(object(filters))
                    .options(options)
                    .build(),
            )
            .await
            .expect("create subscription")
    }

    fn batched(size: usize, timeout_ms: u64) -> WebhookOptions {
        WebhookOptions {
            batch_events: true,
            batch_size: Some(size),
            batch_timeout: Some(timeout_ms),
        }
    }

    #[tokio::test]
    async fn immediate_delivery_posts_envelope_and_stamps_success() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "tool_completed", json!({}), WebhookOptions::default()).await;

        let matched = dispatcher
            .trigger_event(EventType::ToolCompleted, object(json!({"tool": "read_file"})))
            .await;
        assert_eq!(matched, 1);

        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, sub.url);
        assert_eq!(requests[0].event, "tool_completed");
        assert_eq!(requests[0].subscription_id, sub.id);
        assert_eq!(requests[0].body["event"], json!("tool_completed"));
        assert_eq!(requests[0].body["data"], json!({"tool": "read_file"}));
        assert!(requests[0].body["timestamp"].is_string());

        let stored = dispatcher.subscriptions().get(&sub.id).await.expect("get");
        assert!(stored.last_triggered_at.is_some());
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn empty_filter_receives_every_event_of_its_type() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "tool_completed", json!({}), WebhookOptions::default()).await;

        for tool in ["a", "b", "c"] {
            dispatcher
                .trigger_event(EventType::ToolCompleted, object(json!({"tool": tool})))
                .await;
        }
        dispatcher
            .trigger_event(EventType::ToolFailed, object(json!({"tool": "a"})))
            .await;

        assert_eq!(sender.requests().len(), 3);
    }

    #[tokio::test]
    async fn filtered_subscription_only_sees_matching_tool() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "tool_completed", json!({"tool": "x"}), WebhookOptions::default()).await;

        for tool in ["y", "z", "x", "y"] {
            dispatcher
                .trigger_event(EventType::ToolCompleted, object(json!({"tool": tool})))
                .await;
        }

        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["data"]["tool"], json!("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn ten_failed_deliveries_disable_the_subscription() {
        let (dispatcher, sender) = setup();
        sender.set_failing(true);
        let sub = subscribe(&dispatcher, "tool_failed", json!({}), WebhookOptions::default()).await;

        for n in 1..=10u32 {
            dispatcher
                .trigger_event(EventType::ToolFailed, Map::new())
                .await;
            let stored = dispatcher.subscriptions().get(&sub.id).await.expect("get");
            assert_eq!(stored.failure_count, n);
            assert_eq!(stored.active, n < 10);
        }
        assert_eq!(sender.requests().len(), 30, "three attempts per delivery");

        for _ in 0..5 {
            let matched = dispatcher
                .trigger_event(EventType::ToolFailed, Map::new())
                .await;
            assert_eq!(matched, 0);
        }
        assert_eq!(sender.requests().len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_before_giving_up() {
        let (dispatcher, sender) = setup();
        sender.set_failing(true);
        subscribe(&dispatcher, "tool_failed", json!({}), WebhookOptions::default()).await;

        dispatcher
            .trigger_event(EventType::ToolFailed, Map::new())
            .await;

        let times = sender.times();
        assert_eq!(times.len(), 3);
        let gaps: Vec<u128> = times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert!(gaps[0] >= 2000 && gaps[0] < 2100, "gaps {gaps:?}");
        assert!(gaps[1] >= 4000 && gaps[1] < 4100, "gaps {gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "tool_failed", json!({}), WebhookOptions::default()).await;

        sender.set_failing(true);
        for _ in 0..2 {
            dispatcher
                .trigger_event(EventType::ToolFailed, Map::new())
                .await;
        }
        assert_eq!(
            dispatcher.subscriptions().get(&sub.id).await.expect("get").failure_count,
            2
        );

        sender.set_failing(false);
        dispatcher
            .trigger_event(EventType::ToolFailed, Map::new())
            .await;
        assert_eq!(
            dispatcher.subscriptions().get(&sub.id).await.expect("get").failure_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_flushes_when_size_is_reached() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "tool_completed", json!({}), batched(3, 5000)).await;

        for seq in 1..=2 {
            dispatcher
                .trigger_event(EventType::ToolCompleted, object(json!({"seq": seq})))
                .await;
        }
        assert!(sender.requests().is_empty());
        assert_eq!(dispatcher.pending(&sub.id).await, 2);

        dispatcher
            .trigger_event(EventType::ToolCompleted, object(json!({"seq": 3})))
            .await;

        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        let body = &requests[0].body;
        assert_eq!(body["event"], json!("batch"));
        assert_eq!(body["batch"], json!(true));
        let seqs: Vec<_> = body["events"]
            .as_array()
            .expect("events array")
            .iter()
            .map(|e| e["data"]["seq"].clone())
            .collect();
        assert_eq!(seqs, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(dispatcher.pending(&sub.id).await, 0);

        // The cancelled timer must not send an empty or duplicate batch.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sender.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_flushes_once_at_timeout() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "tool_completed", json!({}), batched(10, 5000)).await;

        let started = Instant::now();
        for seq in 1..=2 {
            dispatcher
                .trigger_event(EventType::ToolCompleted, object(json!({"seq": seq})))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(sender.requests().is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["events"].as_array().map(Vec::len), Some(2));

        let sent_after = (sender.times()[0] - started).as_millis();
        assert!((5000..5100).contains(&sent_after), "sent after {sent_after}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_discards_queue_and_timer() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "tool_completed", json!({}), batched(10, 1000)).await;

        dispatcher
            .trigger_event(EventType::ToolCompleted, Map::new())
            .await;
        assert_eq!(dispatcher.pending(&sub.id).await, 1);

        dispatcher.remove_subscription(&sub.id).await.expect("delete");
        assert_eq!(dispatcher.pending(&sub.id).await, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sender.requests().is_empty());

        let err = dispatcher.remove_subscription(&sub.id).await.expect_err("gone");
        assert!(matches!(err, BridgeError::SubscriptionNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_subscription_drops_its_batch() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "tool_completed", json!({}), batched(10, 1000)).await;

        dispatcher
            .trigger_event(EventType::ToolCompleted, Map::new())
            .await;
        dispatcher
            .subscriptions()
            .update(
                &sub.id,
                SubscriptionUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sender.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_batches() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "tool_completed", json!({}), batched(10, 60_000)).await;

        for seq in 1..=2 {
            dispatcher
                .trigger_event(EventType::ToolCompleted, object(json!({"seq": seq})))
                .await;
        }
        dispatcher.shutdown().await;

        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["events"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn publish_runs_in_background_and_shutdown_waits() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "server_connected", json!({"server": "fs"}), WebhookOptions::default())
            .await;

        dispatcher.publish(DomainEvent::server(EventType::ServerConnected, "fs", None));
        dispatcher.publish(DomainEvent::server(EventType::ServerConnected, "other", None));
        dispatcher.shutdown().await;

        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["data"]["server"], json!("fs"));
    }

    #[tokio::test]
    async fn test_event_uses_subscription_type() {
        let (dispatcher, sender) = setup();
        let sub = subscribe(&dispatcher, "prompt_suggested", json!({}), WebhookOptions::default()).await;

        let matched = dispatcher.test_subscription(&sub.id).await.expect("known");
        assert_eq!(matched, 1);
        let body = &sender.requests()[0].body;
        assert_eq!(body["event"], json!("prompt_suggested"));
        assert_eq!(body["data"]["test"], json!(true));
        assert_eq!(body["data"]["webhookId"], json!(sub.id));

        let err = dispatcher.test_subscription("missing").await.expect_err("unknown");
        assert!(matches!(err, BridgeError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn envelope_carries_production_time() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "resource_changed", json!({}), WebhookOptions::default()).await;

        let mut event = DomainEvent::new(EventType::ResourceChanged, object(json!({"uri": "file:///a"})));
        event.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let produced_at = event.timestamp.to_rfc3339();
        assert_eq!(dispatcher.dispatch_event(event).await, 1);

        let requests = sender.requests();
        assert_eq!(requests[0].body["timestamp"], json!(produced_at));
    }

    #[tokio::test(start_paused = true)]
    async fn events_published_during_shutdown_flush_without_waiting() {
        let (dispatcher, sender) = setup();
        subscribe(&dispatcher, "server_disconnected", json!({}), batched(10, 60_000)).await;

        let started = Instant::now();
        dispatcher.publish(DomainEvent::server(EventType::ServerDisconnected, "fs", None));
        dispatcher.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(1), "waited {:?}", started.elapsed());
        let requests = sender.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["events"].as_array().map(Vec::len), Some(1));
    }
}

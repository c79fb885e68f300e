//! Subscription Registry: canonical subscription state with write-through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::store::KeyValueStore;
use super::subscription::{NewSubscription, Subscription, SubscriptionUpdate};
use crate::error::{BridgeError, Result};
use crate::events::EventType;

const KEY_PREFIX: &str = "webhook:";

fn store_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// CRUD over subscriptions. Each record sits behind its own lock, so
/// updates to different subscriptions never contend.
pub struct SubscriptionRegistry {
    store: Arc<dyn KeyValueStore>,
    subscriptions: RwLock<HashMap<String, Arc<Mutex<Subscription>>>>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Read every stored record into memory. Unreadable records are skipped.
    pub async fn load(&self) -> Result<usize> {
        let keys = self.store.keys(KEY_PREFIX).await?;
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Subscription>(&raw) {
                Ok(subscription) => {
                    loaded.insert(
                        subscription.id.clone(),
                        Arc::new(Mutex::new(subscription)),
                    );
                }
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "Skipping unreadable webhook record");
                }
            }
        }

        let count = loaded.len();
        *self.subscriptions.write().await = loaded;
        tracing::info!(count, "Loaded webhooks from store");
        Ok(count)
    }

    pub async fn create(&self, request: NewSubscription) -> Result<Subscription> {
        let subscription = request.into_subscription(Uuid::new_v4().to_string())?;
        self.persist(&subscription).await?;
        self.subscriptions.write().await.insert(
            subscription.id.clone(),
            Arc::new(Mutex::new(subscription.clone())),
        );
        tracing::info!(
            subscription_id = %subscription.id,
            event = %subscription.event,
            "Created webhook"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: &str) -> Result<Subscription> {
        let entry = self.entry(id).await?;
        let subscription = entry.lock().await.clone();
        Ok(subscription)
    }

    /// Every subscription, oldest first.
    pub async fn list(&self) -> Vec<Subscription> {
        let mut all = Vec::new();
        for entry in self.entries().await {
            all.push(entry.lock().await.clone());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub async fn update(&self, id: &str, update: SubscriptionUpdate) -> Result<Subscription> {
        let entry = self.entry(id).await?;
        let mut current = entry.lock().await;
        let next = update.apply(&current)?;
        self.persist(&next).await?;
        *current = next.clone();
        tracing::info!(subscription_id = %id, "Updated webhook");
        Ok(next)
    }

    /// Remove the record. Batch state lives in the dispatcher, which is
    /// why this is only reachable through it.
    pub(crate) async fn delete(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        let _guard = entry.lock().await;
        self.store.delete(&store_key(id)).await?;
        self.subscriptions.write().await.remove(id);
        tracing::info!(subscription_id = %id, "Deleted webhook");
        Ok(())
    }

    /// Active subscriptions for `event_type` whose filters accept `payload`.
    pub async fn matching(
        &self,
        event_type: EventType,
        payload: &Map<String, Value>,
    ) -> Vec<Subscription> {
        let mut matched = Vec::new();
        for entry in self.entries().await {
            let subscription = entry.lock().await;
            if subscription.accepts(event_type, payload) {
                matched.push(subscription.clone());
            }
        }
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched
    }

    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for entry in self.entries().await {
            if entry.lock().await.active {
                count += 1;
            }
        }
        count
    }

    /// Successful delivery: stamp `lastTriggeredAt`, clear the failure run.
    ///
    /// Returns `None` if the subscription was deleted meanwhile.
    pub(crate) async fn record_success(&self, id: &str) -> Result<Option<Subscription>> {
        self.modify(id, |subscription| {
            subscription.failure_count = 0;
            subscription.last_triggered_at = Some(Utc::now());
        })
        .await
    }

    /// Failed delivery: bump the failure run and disable at `threshold`.
    pub(crate) async fn record_failure(
        &self,
        id: &str,
        threshold: u32,
    ) -> Result<Option<Subscription>> {
        self.modify(id, |subscription| {
            subscription.failure_count = subscription.failure_count.saturating_add(1);
            if subscription.failure_count >= threshold && subscription.active {
                subscription.active = false;
                tracing::warn!(
                    subscription_id = %subscription.id,
                    failure_count = subscription.failure_count,
                    "Webhook disabled after repeated failures"
                );
            }
        })
        .await
    }

    async fn modify(
        &self,
        id: &str,
        change: impl FnOnce(&mut Subscription),
    ) -> Result<Option<Subscription>> {
        let entry = match self.entry(id).await {
            Ok(entry) => entry,
            Err(BridgeError::SubscriptionNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        let mut current = entry.lock().await;
        let mut next = current.clone();
        change(&mut next);
        self.persist(&next).await?;
        *current = next.clone();
        Ok(Some(next))
    }

    async fn persist(&self, subscription: &Subscription) -> Result<()> {
        let raw = serde_json::to_string(subscription)?;
        self.store.set(&store_key(&subscription.id), raw).await
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Subscription>>> {
        self.subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::SubscriptionNotFound(id.to_string()))
    }

    async fn entries(&self) -> Vec<Arc<Mutex<Subscription>>> {
        self.subscriptions.read().await.values().cloned().collect()
    }
}

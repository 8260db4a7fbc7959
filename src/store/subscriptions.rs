use crate::error::StoreError;
use crate::store::JsonFile;
use crate::types::WebhookSubscription;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable list of webhook subscriptions consulted on every publish.
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<Uuid, WebhookSubscription>>,
    file: JsonFile,
}

impl SubscriptionRegistry {
    pub fn open(data_dir: Option<&Path>) -> Result<Self, StoreError> {
        let file = JsonFile::new(data_dir, "subscriptions.json", "subscriptions");
        let items: Vec<WebhookSubscription> = file.load()?;
        Ok(Self {
            subscriptions: Mutex::new(items.into_iter().map(|s| (s.id, s)).collect()),
            file,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            file: JsonFile::new(None, "subscriptions.json", "subscriptions"),
        }
    }

    pub async fn create(
        &self,
        sub: WebhookSubscription,
    ) -> Result<WebhookSubscription, StoreError> {
        let mut subs = self.subscriptions.lock().await;
        let previous = subs.insert(sub.id, sub.clone());
        if let Err(e) = self.file.save(subs.values()) {
            match previous {
                Some(prev) => subs.insert(sub.id, prev),
                None => subs.remove(&sub.id),
            };
            return Err(e);
        }
        Ok(sub)
    }

    /// Register `url` unless a subscription for it already exists.
    /// Returns the subscription and whether it was newly created.
    pub async fn register_if_absent(
        &self,
        url: &str,
        events: Vec<String>,
        secret: &str,
    ) -> Result<(WebhookSubscription, bool), StoreError> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(existing) = subs.values().find(|s| s.url == url) {
            return Ok((existing.clone(), false));
        }
        let sub = WebhookSubscription::new(url, events, secret);
        subs.insert(sub.id, sub.clone());
        if let Err(e) = self.file.save(subs.values()) {
            subs.remove(&sub.id);
            return Err(e);
        }
        Ok((sub, true))
    }

    pub async fn list(&self) -> Vec<WebhookSubscription> {
        let subs = self.subscriptions.lock().await;
        let mut items: Vec<WebhookSubscription> = subs.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub async fn get(&self, id: Uuid) -> Option<WebhookSubscription> {
        self.subscriptions.lock().await.get(&id).cloned()
    }

    /// Active subscriptions listening for `event_type` (exact or wildcard).
    pub async fn find_matching(&self, event_type: &str) -> Vec<WebhookSubscription> {
        let subs = self.subscriptions.lock().await;
        let mut items: Vec<WebhookSubscription> =
            subs.values().filter(|s| s.matches(event_type)).cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// The only mutation a subscription ever sees.
    pub async fn set_active(
        &self,
        id: Uuid,
        active: bool,
    ) -> Result<WebhookSubscription, StoreError> {
        let mut subs = self.subscriptions.lock().await;
        let sub = subs.get_mut(&id).ok_or(StoreError::SubscriptionNotFound(id))?;
        let was_active = std::mem::replace(&mut sub.active, active);
        let updated = sub.clone();
        if let Err(e) = self.file.save(subs.values()) {
            if let Some(sub) = subs.get_mut(&id) {
                sub.active = was_active;
            }
            return Err(e);
        }
        Ok(updated)
    }
}

use crate::error::StoreError;
use crate::store::JsonFile;
use crate::types::{DeliveryStatus, WebhookDelivery};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Durable `WebhookDelivery` rows. Only the publisher inserts and only the
/// delivery worker updates.
///
/// A failed write leaves the in-memory rows as they were before the call.
pub struct DeliveryLog {
    deliveries: Mutex<HashMap<Uuid, WebhookDelivery>>,
    file: JsonFile,
    /// Terminal rows kept; the oldest by `updated_at` go first.
    retention: Option<usize>,
}

impl DeliveryLog {
    pub fn open(data_dir: Option<&Path>) -> Result<Self, StoreError> {
        let file = JsonFile::new(data_dir, "deliveries.json", "deliveries");
        let items: Vec<WebhookDelivery> = file.load()?;
        Ok(Self {
            deliveries: Mutex::new(items.into_iter().map(|d| (d.id, d)).collect()),
            file,
            retention: None,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            deliveries: Mutex::new(HashMap::new()),
            file: JsonFile::new(None, "deliveries.json", "deliveries"),
            retention: None,
        }
    }

    /// Keep at most `max_terminal` SUCCESS/FAILED rows. PENDING and
    /// RETRYING rows are never dropped.
    pub fn with_retention(mut self, max_terminal: usize) -> Self {
        self.retention = Some(max_terminal);
        self
    }

    pub async fn insert(&self, delivery: WebhookDelivery) -> Result<(), StoreError> {
        self.insert_many(vec![delivery]).await
    }

    /// Insert every row in one write. On failure none of them is kept.
    pub async fn insert_many(&self, deliveries: Vec<WebhookDelivery>) -> Result<(), StoreError> {
        let mut rows = self.deliveries.lock().await;
        let ids: Vec<Uuid> = deliveries.iter().map(|d| d.id).collect();
        let replaced: Vec<WebhookDelivery> = deliveries
            .into_iter()
            .filter_map(|d| rows.insert(d.id, d))
            .collect();
        let pruned = self.prune(&mut rows);

        if let Err(e) = self.file.save(rows.values()) {
            for id in &ids {
                rows.remove(id);
            }
            for row in replaced.into_iter().chain(pruned) {
                rows.insert(row.id, row);
            }
            return Err(e);
        }
        if !pruned.is_empty() {
            debug!(
                target: "webhook_delivery",
                pruned = pruned.len(),
                "Pruned old terminal deliveries"
            );
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<WebhookDelivery> {
        self.deliveries.lock().await.get(&id).cloned()
    }

    /// Newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<DeliveryStatus>) -> Vec<WebhookDelivery> {
        let rows = self.deliveries.lock().await;
        let mut items: Vec<WebhookDelivery> = rows
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Deliveries that were PENDING or RETRYING when last persisted.
    pub async fn unfinished(&self) -> Vec<WebhookDelivery> {
        let rows = self.deliveries.lock().await;
        let mut items: Vec<WebhookDelivery> = rows
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Apply `f` to one row and persist. Returns the updated row.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Result<WebhookDelivery, StoreError>
    where
        F: FnOnce(&mut WebhookDelivery),
    {
        let mut rows = self.deliveries.lock().await;
        let row = rows.get_mut(&id).ok_or(StoreError::DeliveryNotFound(id))?;
        let previous = row.clone();
        f(row);
        row.updated_at = Utc::now();
        let updated = row.clone();
        if let Err(e) = self.file.save(rows.values()) {
            rows.insert(id, previous);
            return Err(e);
        }
        Ok(updated)
    }

    /// Drop the oldest terminal rows beyond the retention limit and return
    /// them.
    fn prune(&self, rows: &mut HashMap<Uuid, WebhookDelivery>) -> Vec<WebhookDelivery> {
        let Some(max) = self.retention else {
            return Vec::new();
        };
        let mut terminal: Vec<(chrono::DateTime<Utc>, Uuid)> = rows
            .values()
            .filter(|d| d.status.is_terminal())
            .map(|d| (d.updated_at, d.id))
            .collect();
        if terminal.len() <= max {
            return Vec::new();
        }
        terminal.sort();
        let excess = terminal.len() - max;
        terminal[..excess]
            .iter()
            .filter_map(|(_, id)| rows.remove(id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.deliveries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deliveries.lock().await.is_empty()
    }
}

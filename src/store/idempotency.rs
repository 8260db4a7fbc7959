//! Receiver-side idempotency tables.
//!
//! Uniqueness is decided inside the table's lock: callers never check and
//! then insert in two steps, so two concurrent copies of the same delivery
//! cannot both be accepted.

use crate::error::StoreError;
use crate::store::JsonFile;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Result of an insert into a uniqueness-enforcing table.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same key already existed; it is returned unchanged.
    Duplicate(T),
}

/// An event accepted by the event-logger endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub idempotency_key: Uuid,
    pub event_id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Processed-events table keyed by `idempotency_key`.
pub struct ProcessedEvents {
    rows: Mutex<HashMap<Uuid, ProcessedEvent>>,
    file: JsonFile,
    retention: Option<Duration>,
}

impl ProcessedEvents {
    pub fn open(data_dir: Option<&Path>) -> Result<Self, StoreError> {
        let file = JsonFile::new(data_dir, "processed_events.json", "processed events");
        let items: Vec<ProcessedEvent> = file.load()?;
        Ok(Self {
            rows: Mutex::new(items.into_iter().map(|e| (e.idempotency_key, e)).collect()),
            file,
            retention: None,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            file: JsonFile::new(None, "processed_events.json", "processed events"),
            retention: None,
        }
    }

    /// Forget events received more than `retention` ago. Must be at least
    /// twice the replay window: a duplicate older than that fails the
    /// freshness check before it reaches this table.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub async fn get(&self, idempotency_key: Uuid) -> Option<ProcessedEvent> {
        self.rows.lock().await.get(&idempotency_key).cloned()
    }

    /// Insert unless the key is already present. The row is persisted before
    /// the lock is released; on a write failure nothing is kept.
    pub async fn insert_unique(
        &self,
        event: ProcessedEvent,
    ) -> Result<InsertOutcome<ProcessedEvent>, StoreError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(&event.idempotency_key) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        let pruned = match self.retention {
            Some(retention) => {
                let cutoff = Utc::now() - retention;
                prune(&mut rows, |e| e.received_at < cutoff)
            }
            None => Vec::new(),
        };
        let key = event.idempotency_key;
        rows.insert(key, event.clone());
        if let Err(e) = self.file.save(rows.values()) {
            rows.remove(&key);
            rows.extend(pruned);
            return Err(e);
        }
        if !pruned.is_empty() {
            debug!(
                target: "webhook_receiver",
                pruned = pruned.len(),
                "Pruned expired processed events"
            );
        }
        Ok(InsertOutcome::Inserted(event))
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationState {
    InFlight,
    Sent,
    Failed,
}

/// Outcome of one notification channel for one logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub idempotency_key: Uuid,
    pub channel: String,
    pub state: NotificationState,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    fn channel_key(&self) -> (Uuid, String) {
        (self.idempotency_key, self.channel.clone())
    }
}

/// Answer to "may this request send on this channel?".
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelClaim {
    /// The caller owns the send and must call `complete`.
    Claimed,
    AlreadySent(NotificationRecord),
    /// Another request is sending right now.
    InFlight(NotificationRecord),
}

/// How long an IN_FLIGHT claim blocks others before it is considered
/// abandoned (e.g. the process died mid-send).
const DEFAULT_CLAIM_LEASE_SECS: i64 = 60;

/// Processed-notifications table keyed by `(idempotency_key, channel)`.
pub struct NotificationLedger {
    rows: Mutex<HashMap<(Uuid, String), NotificationRecord>>,
    file: JsonFile,
    claim_lease: Duration,
    retention: Option<Duration>,
}

impl NotificationLedger {
    pub fn open(data_dir: Option<&Path>) -> Result<Self, StoreError> {
        let file = JsonFile::new(
            data_dir,
            "processed_notifications.json",
            "processed notifications",
        );
        let items: Vec<NotificationRecord> = file.load()?;
        Ok(Self {
            rows: Mutex::new(
                items
                    .into_iter()
                    .map(|r| ((r.idempotency_key, r.channel.clone()), r))
                    .collect(),
            ),
            file,
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
            retention: None,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            file: JsonFile::new(
                None,
                "processed_notifications.json",
                "processed notifications",
            ),
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
            retention: None,
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Drop records not touched for `retention`. A retry arriving after
    /// that is treated as a new notification.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Atomically take ownership of sending `channel` for `idempotency_key`.
    ///
    /// A missing or FAILED record (or an IN_FLIGHT one past its lease) is
    /// claimed; SENT is never claimed again.
    pub async fn claim(
        &self,
        idempotency_key: Uuid,
        channel: &str,
    ) -> Result<ChannelClaim, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = (idempotency_key, channel.to_string());
        let now = Utc::now();

        let previous = rows.get(&key).cloned();
        match &previous {
            Some(r) if r.state == NotificationState::Sent => {
                return Ok(ChannelClaim::AlreadySent(r.clone()));
            }
            Some(r)
                if r.state == NotificationState::InFlight
                    && now - r.updated_at < self.claim_lease =>
            {
                return Ok(ChannelClaim::InFlight(r.clone()));
            }
            _ => {}
        }

        let pruned = match self.retention {
            Some(retention) => {
                let cutoff = now - retention;
                prune(&mut rows, |r| r.updated_at < cutoff && r.channel_key() != key)
            }
            None => Vec::new(),
        };
        let attempts = previous.as_ref().map_or(0, |r| r.attempts) + 1;
        rows.insert(
            key.clone(),
            NotificationRecord {
                idempotency_key,
                channel: channel.to_string(),
                state: NotificationState::InFlight,
                message_id: None,
                error: None,
                attempts,
                updated_at: now,
            },
        );
        if let Err(e) = self.file.save(rows.values()) {
            match previous {
                Some(prev) => rows.insert(key, prev),
                None => rows.remove(&key),
            };
            rows.extend(pruned);
            return Err(e);
        }
        debug!(
            target: "webhook_receiver",
            idempotency_key = %idempotency_key,
            channel,
            attempts,
            pruned = pruned.len(),
            "Claimed notification channel"
        );
        Ok(ChannelClaim::Claimed)
    }

    /// Record the outcome of a claimed send.
    pub async fn complete(
        &self,
        idempotency_key: Uuid,
        channel: &str,
        outcome: Result<String, String>,
    ) -> Result<NotificationRecord, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = (idempotency_key, channel.to_string());
        let previous = rows.get(&key).cloned();
        let mut record = previous.clone().unwrap_or_else(|| NotificationRecord {
            idempotency_key,
            channel: channel.to_string(),
            state: NotificationState::InFlight,
            message_id: None,
            error: None,
            attempts: 1,
            updated_at: Utc::now(),
        });
        match outcome {
            Ok(message_id) => {
                record.state = NotificationState::Sent;
                record.message_id = Some(message_id);
                record.error = None;
            }
            Err(error) => {
                record.state = NotificationState::Failed;
                record.error = Some(error);
            }
        }
        record.updated_at = Utc::now();
        rows.insert(key.clone(), record.clone());
        if let Err(e) = self.file.save(rows.values()) {
            match previous {
                Some(prev) => rows.insert(key, prev),
                None => rows.remove(&key),
            };
            return Err(e);
        }
        Ok(record)
    }

    /// All channel records for one logical event, sorted by channel.
    pub async fn records_for(&self, idempotency_key: Uuid) -> Vec<NotificationRecord> {
        let rows = self.rows.lock().await;
        let mut items: Vec<NotificationRecord> = rows
            .values()
            .filter(|r| r.idempotency_key == idempotency_key)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.channel.cmp(&b.channel));
        items
    }
}

/// Remove and return every row matching `expired`.
fn prune<K, V, F>(rows: &mut HashMap<K, V>, expired: F) -> Vec<(K, V)>
where
    K: std::hash::Hash + Eq + Clone,
    F: Fn(&V) -> bool,
{
    let keys: Vec<K> = rows
        .iter()
        .filter(|(_, v)| expired(v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.into_iter()
        .filter_map(|k| rows.remove(&k).map(|v| (k, v)))
        .collect()
}

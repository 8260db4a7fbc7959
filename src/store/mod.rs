//! JSON-file persistence for subscriptions, deliveries and idempotency records.
//!
//! Every store keeps its rows in memory behind a mutex and rewrites its file
//! after each mutation. A store opened without a directory stays in memory.

pub mod deliveries;
pub mod idempotency;
pub mod subscriptions;

pub use deliveries::DeliveryLog;
pub use idempotency::{
    ChannelClaim, InsertOutcome, NotificationLedger, NotificationRecord, NotificationState,
    ProcessedEvent, ProcessedEvents,
};
pub use subscriptions::SubscriptionRegistry;

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A single JSON array file backing one table.
#[derive(Debug, Clone)]
pub(crate) struct JsonFile {
    path: Option<PathBuf>,
    what: &'static str,
}

impl JsonFile {
    pub(crate) fn new(data_dir: Option<&Path>, file_name: &str, what: &'static str) -> Self {
        Self {
            path: data_dir.map(|d| d.join(file_name)),
            what,
        }
    }

    pub(crate) fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| StoreError::Serde {
            what: self.what,
            cause: e.to_string(),
        })
    }

    /// Write through a temp file and rename so a crash never leaves a
    /// half-written table behind.
    pub(crate) fn save<'a, T, I>(&self, items: I) -> Result<(), StoreError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let items: Vec<&T> = items.into_iter().collect();
        let content = serde_json::to_string_pretty(&items).map_err(|e| StoreError::Serde {
            what: self.what,
            cause: e.to_string(),
        })?;

        let write_err = |e: std::io::Error| StoreError::Write {
            path: path.display().to_string(),
            cause: e.to_string(),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)
    }
}

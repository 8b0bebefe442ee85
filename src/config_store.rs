//! Single-row guard over the provider's persistent configuration table.
//!
//! The host tool keeps one provider-agnostic configuration blob in a
//! key-value table owned by this provider. The table holding zero rows means
//! "not installed", exactly one row is the configuration, and anything more
//! is a corrupted store that must surface as such instead of being silently
//! resolved by picking a row.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Row identifier used when the host tool does not supply one.
pub const DEFAULT_CONFIG_ID: &str = "config";

/// One row of the configuration table: an opaque identifier plus the JSON
/// payload owned by the host tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: String,
    pub config_json: String,
}

/// Distinct, branchable conditions of the configuration store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigStoreError {
    /// The table is missing or empty: the provider has never been installed.
    /// An expected condition, not a generic not-found error.
    #[error("no configuration found: provider is not installed")]
    NotInstalled,

    /// More than one row exists where at most one is allowed.
    #[error("{0} configuration records found where at most one is allowed")]
    Corrupted(usize),
}

/// Key-value table operations consumed by the guard. Table lifecycle
/// semantics expected from implementations: creating an existing table is
/// success, scanning a missing table yields no rows, removing a missing
/// table is success.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn create_table(&self) -> Result<()>;
    async fn remove_table(&self) -> Result<()>;
    async fn scan_records(&self) -> Result<Vec<ConfigRecord>>;
    async fn put_record(&self, record: &ConfigRecord) -> Result<()>;
}

/// Enforces the single-row invariant over a [`ConfigStore`].
pub struct ConfigStoreGuard {
    store: Arc<dyn ConfigStore>,
}

impl ConfigStoreGuard {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// Create the backing table. Safe to call repeatedly.
    pub async fn install(&self) -> Result<()> {
        self.store.create_table().await
    }

    /// Remove the backing table and everything in it.
    pub async fn uninstall(&self) -> Result<()> {
        self.store.remove_table().await
    }

    /// Fetch the single configuration payload.
    ///
    /// Fails with [`ConfigStoreError::NotInstalled`] on an empty store and
    /// [`ConfigStoreError::Corrupted`] when more than one row exists.
    pub async fn lookup(&self) -> Result<String> {
        let records = self.store.scan_records().await?;
        let record = single_record(records)?;
        debug!(id = %record.id, "Loaded provider configuration");
        Ok(record.config_json)
    }

    /// Upsert the configuration payload under the given row id. Safe to call
    /// whether or not a row currently exists.
    pub async fn save(&self, id: &str, config_json: &str) -> Result<()> {
        self.store
            .put_record(&ConfigRecord {
                id: id.to_string(),
                config_json: config_json.to_string(),
            })
            .await
    }
}

/// The single-row invariant itself, as a pure function over the scan result.
fn single_record(mut records: Vec<ConfigRecord>) -> Result<ConfigRecord, ConfigStoreError> {
    match records.len() {
        0 => Err(ConfigStoreError::NotInstalled),
        1 => Ok(records.remove(0)),
        n => Err(ConfigStoreError::Corrupted(n)),
    }
}

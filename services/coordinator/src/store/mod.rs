//! Durable storage for the coordinator.
//!
//! This module provides:
//! - The `KvStore` trait every coordinator operation receives (no ambient
//!   storage handles)
//! - Key layout for the persisted records
//! - An in-process store for dev mode and tests
//! - A Postgres-backed store
//!
//! The store is the lagging durable copy of coordinator state. Live state is
//! held in memory by the registry and always wins over the persisted copy;
//! the store is read once at startup and written under the write-throttling
//! policy.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgConfig, PgStore};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("store query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("store migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("failed to encode stored value: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode stored value at '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Key-value storage seam for coordinator state.
///
/// Implementations must make `put_if_absent` atomic: it is the
/// compare-and-swap primitive that decides leadership races. All other
/// operations are last-writer-wins whole-record overwrites, which is
/// acceptable because liveness data is advisory.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a value, replacing any existing one.
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Write a value only if the key is currently absent.
    ///
    /// Returns `true` if the write happened, `false` if another value was
    /// already present. Atomic with respect to concurrent callers.
    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool, StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`. Used only by the cold
    /// read at startup.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Typed read helper over the JSON store surface.
pub async fn get_typed<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => {
            let decoded = serde_json::from_value(value).map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            })?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}

/// Typed write helper over the JSON store surface.
pub async fn put_typed<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_value(value).map_err(StoreError::Encode)?;
    store.put(key, encoded).await
}

/// Persisted key layout.
///
/// One record per worker, one index of all worker ids, one record per
/// service name, one singleton leadership pointer, one singleton list of
/// regional coordinators.
pub mod keys {
    use swb_id::WorkerId;

    /// Index of all registered worker ids.
    pub const WORKER_INDEX: &str = "workers/index";

    /// Singleton heartbeat-leader pointer.
    pub const LEADER: &str = "leader";

    /// Singleton list of regional coordinators.
    pub const COORDINATORS: &str = "coordinators";

    /// Per-worker record key.
    pub fn worker(id: &WorkerId) -> String {
        format!("worker/{id}")
    }

    /// Per-service member-set key.
    pub fn service(name: &str) -> String {
        format!("service/{name}")
    }
}

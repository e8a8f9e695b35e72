//! In-process store used in dev mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{KvStore, StoreError};

/// In-memory `KvStore`.
///
/// Counts durable write operations so tests can assert the write-throttling
/// policy (a heartbeat with unchanged status inside the throttle window must
/// not produce a write).
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write operations (put, successful put_if_absent, delete of
    /// a present key) performed against this store.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        // The write lock is held across check and insert, which is what makes
        // this a compare-and-swap for concurrent callers.
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.entries.write().await.remove(key).is_some() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let entries = self.entries.read().await;
        let mut matched: Vec<(String, Value)> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent_only_first_wins() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("leader", json!("a")).await.unwrap());
        assert!(!store.put_if_absent("leader", json!("b")).await.unwrap());
        assert_eq!(store.get("leader").await.unwrap(), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("k", json!(1)).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_count_tracks_mutations_only() {
        let store = MemoryStore::new();
        store.put("k", json!(1)).await.unwrap();
        let _ = store.get("k").await.unwrap();
        let _ = store.get("k").await.unwrap();
        store.delete("absent").await.unwrap();
        assert_eq!(store.write_count(), 1);
    }
}

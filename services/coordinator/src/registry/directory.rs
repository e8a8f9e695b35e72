//! Service directory: service name → set of worker ids.
//!
//! The directory is eventually consistent with the worker registry. A set
//! may transiently hold ids with no backing record or a stale heartbeat;
//! those are pruned opportunistically when the registry resolves the
//! service, never by a background sweep. An entry is deleted once its set
//! becomes empty.

use std::collections::{BTreeMap, BTreeSet};

use swb_id::WorkerId;
use tokio::sync::RwLock;

/// In-memory live view of the directory. Persistence of changed sets is the
/// registry's concern.
#[derive(Default)]
pub struct Directory {
    entries: RwLock<BTreeMap<String, BTreeSet<WorkerId>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the directory from a persisted snapshot (cold start).
    pub async fn load(&self, snapshot: BTreeMap<String, BTreeSet<WorkerId>>) {
        *self.entries.write().await = snapshot;
    }

    /// Add a worker to a service's set, creating the entry if absent.
    /// Idempotent. Returns the resulting member set.
    pub async fn add(&self, service: &str, id: WorkerId) -> BTreeSet<WorkerId> {
        let mut entries = self.entries.write().await;
        let set = entries.entry(service.to_string()).or_default();
        set.insert(id);
        set.clone()
    }

    /// Remove a worker from every set it belongs to, deleting entries left
    /// empty. Returns each touched service name with its remaining set
    /// (empty set means the entry was deleted).
    pub async fn remove_worker(&self, id: WorkerId) -> Vec<(String, BTreeSet<WorkerId>)> {
        let mut entries = self.entries.write().await;
        let mut touched = Vec::new();

        entries.retain(|name, set| {
            if set.remove(&id) {
                touched.push((name.clone(), set.clone()));
            }
            !set.is_empty()
        });

        touched
    }

    /// Current member set for a service, or `None` if the service name is
    /// unknown.
    pub async fn members(&self, service: &str) -> Option<BTreeSet<WorkerId>> {
        self.entries.read().await.get(service).cloned()
    }

    /// Replace a service's member set with a pruned copy, deleting the entry
    /// if the pruned set is empty.
    pub async fn replace(&self, service: &str, pruned: BTreeSet<WorkerId>) {
        let mut entries = self.entries.write().await;
        if pruned.is_empty() {
            entries.remove(service);
        } else {
            entries.insert(service.to_string(), pruned);
        }
    }

    /// All known service names.
    pub async fn service_names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Full snapshot of the directory.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeSet<WorkerId>> {
        self.entries.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let directory = Directory::new();
        let id = WorkerId::new();

        let set = directory.add("notes", id).await;
        assert_eq!(set.len(), 1);
        let set = directory.add("notes", id).await;
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_worker_deletes_empty_entries() {
        let directory = Directory::new();
        let a = WorkerId::new();
        let b = WorkerId::new();

        directory.add("notes", a).await;
        directory.add("notes", b).await;
        directory.add("ocr", a).await;

        let touched = directory.remove_worker(a).await;
        assert_eq!(touched.len(), 2);

        // "ocr" had only worker a, so its entry is gone entirely.
        assert!(directory.members("ocr").await.is_none());
        assert_eq!(directory.members("notes").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_worker_touches_nothing() {
        let directory = Directory::new();
        directory.add("notes", WorkerId::new()).await;

        let touched = directory.remove_worker(WorkerId::new()).await;
        assert!(touched.is_empty());
        assert_eq!(directory.members("notes").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_empty_set_deletes_entry() {
        let directory = Directory::new();
        directory.add("notes", WorkerId::new()).await;

        directory.replace("notes", BTreeSet::new()).await;
        assert!(directory.members("notes").await.is_none());
        assert!(directory.service_names().await.is_empty());
    }
}
